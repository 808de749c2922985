//! Tests for DriveClient with mocked HTTP responses.

use std::io::Write;

use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use tempfile::NamedTempFile;

use drive_sync::models::{FileListResponse, FileMetadata, ServiceAccountCredentials};
use drive_sync::{Authenticator, DriveClient, RemoteStore};

/// A client whose token and API endpoints all point at `server`.
async fn client_for(server: &mut ServerGuard) -> (DriveClient, NamedTempFile) {
    server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"access_token": "tok", "expires_in": 3600}).to_string())
        .create_async()
        .await;

    let mut creds = NamedTempFile::new().unwrap();
    let creds_json = json!({
        "client_id": "cid",
        "client_secret": "secret",
        "refresh_token": "refresh",
        "token_uri": format!("{}/token", server.url()),
    });
    creds.write_all(creds_json.to_string().as_bytes()).unwrap();

    let auth = Authenticator::from_file(creds.path()).unwrap();
    let client = DriveClient::new(auth)
        .with_endpoints(server.url(), format!("{}/upload", server.url()));
    (client, creds)
}

fn api_error(code: u16, reason: &str) -> String {
    json!({
        "error": {
            "code": code,
            "message": format!("{} happened", reason),
            "errors": [{"reason": reason}]
        }
    })
    .to_string()
}

mod models {
    use super::*;

    #[test]
    fn test_file_metadata_deserialization() {
        let json = json!({
            "id": "file123",
            "name": "document.pdf",
            "mimeType": "application/pdf",
            "size": "2048",
            "modifiedTime": "2024-05-01T10:00:00.000Z",
            "sha256Checksum": "abc",
            "parents": ["folder1"]
        });

        let metadata: FileMetadata = serde_json::from_value(json).unwrap();

        assert_eq!(metadata.id, "file123");
        assert_eq!(metadata.mime_type, Some("application/pdf".to_string()));
        assert_eq!(metadata.size, Some(2048));
        assert_eq!(metadata.sha256_checksum.as_deref(), Some("abc"));
        assert_eq!(metadata.parents, vec!["folder1".to_string()]);
        assert!(metadata.modified_time.is_some());
        assert!(!metadata.is_folder());
        assert!(!metadata.is_google_native());
    }

    #[test]
    fn test_folder_and_native_files() {
        let folder: FileMetadata = serde_json::from_value(json!({
            "id": "folder123",
            "name": "My Folder",
            "mimeType": "application/vnd.google-apps.folder"
        }))
        .unwrap();
        assert!(folder.is_folder());
        assert!(!folder.is_google_native());
        assert_eq!(folder.size, None);

        let doc: FileMetadata = serde_json::from_value(json!({
            "id": "doc1",
            "name": "Notes",
            "mimeType": "application/vnd.google-apps.document"
        }))
        .unwrap();
        assert!(doc.is_google_native());
    }

    #[test]
    fn test_file_list_response_deserialization() {
        let json = json!({
            "files": [
                {"id": "f1", "name": "file1.txt"},
                {"id": "f2", "name": "file2.txt"}
            ],
            "nextPageToken": "token123"
        });

        let response: FileListResponse = serde_json::from_value(json).unwrap();

        assert_eq!(response.files.len(), 2);
        assert_eq!(response.next_page_token, Some("token123".to_string()));
    }

    #[test]
    fn test_display_with_size() {
        let metadata = FileMetadata {
            id: "abc123".to_string(),
            name: "document.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
            size: Some(1048576),
            ..Default::default()
        };

        let display = format!("{}", metadata);
        assert!(display.contains("abc123"));
        assert!(display.contains("1.00 MB"));
        assert!(display.contains("application/pdf"));
    }
}

mod credentials {
    use super::*;

    #[test]
    fn test_service_account_from_json() {
        let json = json!({
            "client_email": "test@project.iam.gserviceaccount.com",
            "private_key": "key",
            "token_uri": "https://oauth2.googleapis.com/token"
        });

        let creds: ServiceAccountCredentials = serde_json::from_value(json).unwrap();
        assert_eq!(creds.client_email, "test@project.iam.gserviceaccount.com");
    }

    #[test]
    fn test_authenticator_from_invalid_file() {
        let auth = Authenticator::from_file("/nonexistent/path/credentials.json");
        assert!(auth.is_err());
    }

    #[test]
    fn test_authenticator_from_invalid_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"not valid json").unwrap();

        assert!(Authenticator::from_file(temp_file.path()).is_err());
    }

    #[tokio::test]
    async fn test_refresh_token_exchange_is_cached() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(200)
            .with_body(json!({"access_token": "tok", "expires_in": 3600}).to_string())
            .expect(1)
            .create_async()
            .await;

        let mut creds = NamedTempFile::new().unwrap();
        let body = json!({
            "client_id": "cid",
            "client_secret": "secret",
            "refresh_token": "refresh",
            "token_uri": format!("{}/token", server.url()),
        });
        creds.write_all(body.to_string().as_bytes()).unwrap();

        let auth = Authenticator::from_file(creds.path()).unwrap();
        assert_eq!(auth.get_access_token().await.unwrap(), "tok");
        assert_eq!(auth.get_access_token().await.unwrap(), "tok");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_endpoint_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body("invalid_grant")
            .create_async()
            .await;

        let mut creds = NamedTempFile::new().unwrap();
        let body = json!({
            "client_id": "cid",
            "client_secret": "secret",
            "refresh_token": "revoked",
            "token_uri": format!("{}/token", server.url()),
        });
        creds.write_all(body.to_string().as_bytes()).unwrap();

        let auth = Authenticator::from_file(creds.path()).unwrap();
        let err = auth.get_access_token().await.unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }
}

mod listing {
    use super::*;

    #[tokio::test]
    async fn test_list_children_follows_pages() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;

        let first = server
            .mock("GET", "/files")
            .match_header("authorization", "Bearer tok")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "'parent1' in parents and trashed = false".into()),
                Matcher::UrlEncoded("pageSize".into(), "1000".into()),
                Matcher::Regex("fields=[^&]*$".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({"files": [{"id": "a", "name": "a.txt"}], "nextPageToken": "p2"}).to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/files")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_body(json!({"files": [{"id": "b", "name": "b.txt"}]}).to_string())
            .create_async()
            .await;

        let files = client.list_children("parent1").await.unwrap();
        let ids: Vec<_> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_shared_drive_scopes_queries() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        let client = client.with_shared_drive("drive9");

        let mock = server
            .mock("GET", "/files")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("driveId".into(), "drive9".into()),
                Matcher::UrlEncoded("corpora".into(), "drive".into()),
            ]))
            .with_status(200)
            .with_body(json!({"files": []}).to_string())
            .create_async()
            .await;

        assert!(client.list_children("root9").await.unwrap().is_empty());
        assert_eq!(client.drive_id(), Some("drive9"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_find_file_picks_newest() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;

        server
            .mock("GET", "/files")
            .match_query(Matcher::UrlEncoded(
                "q".into(),
                "name = 'it\\'s.txt' and 'p' in parents and mimeType != 'application/vnd.google-apps.folder' and trashed = false".into(),
            ))
            .with_status(200)
            .with_body(
                json!({"files": [
                    {"id": "new", "name": "it's.txt", "modifiedTime": "2024-06-01T00:00:00Z"},
                    {"id": "old", "name": "it's.txt", "modifiedTime": "2024-01-01T00:00:00Z"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let found = client.find_file("it's.txt", "p").await.unwrap().unwrap();
        assert_eq!(found.id, "new");
    }
}

mod errors {
    use super::*;

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        server
            .mock("GET", "/files/f1")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(api_error(403, "rateLimitExceeded"))
            .create_async()
            .await;

        let err = client.get("f1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permission_denied_is_fatal() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        server
            .mock("GET", "/files/f1")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(api_error(403, "insufficientPermissions"))
            .create_async()
            .await;

        let err = client.get("f1").await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_server_error_without_json_body() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        server
            .mock("GET", "/files/f1")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("backend unavailable")
            .create_async()
            .await;

        let err = client.get("f1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn test_not_found() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        server
            .mock("GET", "/files/gone")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(api_error(404, "notFound"))
            .create_async()
            .await;

        let err = client.get("gone").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }
}

mod mutations {
    use super::*;

    #[tokio::test]
    async fn test_delete_trashes_by_default() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        let mock = server
            .mock("PATCH", "/files/f1")
            .match_query(Matcher::Any)
            .match_body(Matcher::Json(json!({"trashed": true})))
            .with_status(200)
            .with_body(json!({"id": "f1", "name": "x"}).to_string())
            .create_async()
            .await;

        client.delete("f1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_permanent_delete_and_missing_item() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        let client = client.with_trash(false);
        let mock = server
            .mock("DELETE", "/files/f1")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(api_error(404, "notFound"))
            .create_async()
            .await;

        client.delete("f1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rename_moves_between_parents() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        let mock = server
            .mock("PATCH", "/files/f1")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("addParents".into(), "new".into()),
                Matcher::UrlEncoded("removeParents".into(), "old".into()),
            ]))
            .match_body(Matcher::Json(json!({"name": "b.txt"})))
            .with_status(200)
            .with_body(json!({"id": "f1", "name": "b.txt", "parents": ["new"]}).to_string())
            .create_async()
            .await;

        let moved = client.rename("f1", "b.txt", "old", "new").await.unwrap();
        assert_eq!(moved.parents, vec!["new".to_string()]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_small_upload_uses_multipart() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        let mock = server
            .mock("POST", "/upload/files")
            .match_query(Matcher::UrlEncoded("uploadType".into(), "multipart".into()))
            .with_status(200)
            .with_body(
                json!({"id": "up1", "name": "notes.txt", "sha256Checksum": "h"}).to_string(),
            )
            .create_async()
            .await;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let uploaded = client
            .upload(file.path(), "notes.txt", "parent1", None)
            .await
            .unwrap();
        assert_eq!(uploaded.id, "up1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_replacing_existing_file() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        let mock = server
            .mock("PATCH", "/upload/files/up1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"id": "up1", "name": "notes.txt"}).to_string())
            .create_async()
            .await;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello again").unwrap();

        client
            .upload(file.path(), "notes.txt", "parent1", Some("up1"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_streams_to_file() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        server
            .mock("GET", "/files/f1")
            .match_query(Matcher::UrlEncoded("alt".into(), "media".into()))
            .with_status(200)
            .with_body("file content")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        client.download("f1", &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "file content");
    }

    #[tokio::test]
    async fn test_create_folder() {
        let mut server = Server::new_async().await;
        let (client, _creds) = client_for(&mut server).await;
        server
            .mock("POST", "/files")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "name": "Reports",
                "mimeType": "application/vnd.google-apps.folder",
                "parents": ["p1"]
            })))
            .with_status(200)
            .with_body(
                json!({"id": "d1", "name": "Reports", "mimeType": "application/vnd.google-apps.folder"})
                    .to_string(),
            )
            .create_async()
            .await;

        let folder = client.create_folder("Reports", "p1").await.unwrap();
        assert!(folder.is_folder());
        assert_eq!(folder.id, "d1");
    }
}
