use std::time::Duration;

use serde_json::{Map, Value, json};
use tempfile::TempDir;
use warden_core::permission::{
    InboundRequest, MailboxRequest, MailboxResponse, PermissionClient, PermissionMailbox,
};
use warden_infrastructure::mailbox::{FsMailbox, FsMailboxClient, request_path, response_path};

const POLL: Duration = Duration::from_millis(10);

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn parsed(inbound: InboundRequest) -> MailboxRequest {
    match inbound {
        InboundRequest::Request(request) => request,
        other => panic!("expected a parsed request, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fs_mailbox_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let mailbox = FsMailbox::open(temp_dir.path(), POLL).await.unwrap();
    let client = FsMailboxClient::new(temp_dir.path(), POLL);

    let request = MailboxRequest::new("tab-1", "Write", inputs(json!({"file_path": "/a.txt"})));
    let request_id = request.request_id.clone();

    let waiting = tokio::spawn(async move {
        client.request(request, Duration::from_secs(5)).await
    });

    let received = parsed(
        tokio::time::timeout(Duration::from_secs(5), mailbox.next_request())
            .await
            .unwrap()
            .unwrap()
            .unwrap(),
    );
    assert_eq!(received.request_id, request_id);
    assert_eq!(received.tool_name, "Write");
    // Claimed requests are removed from the directory.
    assert!(!request_path(temp_dir.path(), "tab-1").exists());

    mailbox
        .respond(MailboxResponse {
            request_id: request_id.clone(),
            channel_id: "tab-1".into(),
            allow: true,
            message: None,
        })
        .await
        .unwrap();

    let response = waiting.await.unwrap().unwrap();
    assert!(response.allow);
    assert_eq!(response.request_id, request_id);
    assert!(!response_path(temp_dir.path(), "tab-1").exists());
}

#[tokio::test]
async fn test_fs_client_timeout_is_deny() {
    let temp_dir = TempDir::new().unwrap();
    let client = FsMailboxClient::new(temp_dir.path(), POLL);

    let request = MailboxRequest::new("tab-2", "Bash", inputs(json!({"command": "rm -rf /"})));
    let response = client
        .request(request, Duration::from_millis(100))
        .await
        .unwrap();

    assert!(!response.allow);
    assert_eq!(response.message.as_deref(), Some("Permission request timed out"));
    assert!(!request_path(temp_dir.path(), "tab-2").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fs_client_ignores_stale_response() {
    let temp_dir = TempDir::new().unwrap();
    let stale = MailboxResponse {
        request_id: "old-request".into(),
        channel_id: "tab-3".into(),
        allow: true,
        message: None,
    };
    std::fs::write(
        response_path(temp_dir.path(), "tab-3"),
        serde_json::to_vec(&stale).unwrap(),
    )
    .unwrap();

    let client = FsMailboxClient::new(temp_dir.path(), POLL);
    let request = MailboxRequest::new("tab-3", "Edit", Map::new());
    let response = client
        .request(request, Duration::from_millis(150))
        .await
        .unwrap();

    // The stale allow must not answer the new request.
    assert!(!response.allow);
}

#[tokio::test]
async fn test_fs_mailbox_reports_malformed_request() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(request_path(temp_dir.path(), "tab-4"), "{ not json").unwrap();

    let mailbox = FsMailbox::open(temp_dir.path(), POLL).await.unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(5), mailbox.next_request())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    match inbound {
        InboundRequest::Malformed { channel_id, message } => {
            assert_eq!(channel_id, "tab-4");
            assert!(message.starts_with("Malformed permission request"));
        }
        other => panic!("expected a malformed request, got {other:?}"),
    }
    assert!(!request_path(temp_dir.path(), "tab-4").exists());
    // Answering is left to the deciding side.
    assert!(!response_path(temp_dir.path(), "tab-4").exists());

    mailbox.close();
    assert!(mailbox.next_request().await.unwrap().is_none());
}

#[cfg(unix)]
mod socket {
    use super::*;
    use warden_infrastructure::mailbox::{SocketMailbox, SocketMailboxClient};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_socket_round_trip_correlates_by_request_id() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        let mailbox = SocketMailbox::bind(&socket_path).await.unwrap();

        let first = MailboxRequest::new("tab-a", "Write", Map::new());
        let second = MailboxRequest::new("tab-b", "Bash", Map::new());

        let client_a = SocketMailboxClient::new(&socket_path);
        let client_b = SocketMailboxClient::new(&socket_path);
        let a = tokio::spawn({
            let request = first.clone();
            async move { client_a.request(request, Duration::from_secs(5)).await }
        });
        let b = tokio::spawn({
            let request = second.clone();
            async move { client_b.request(request, Duration::from_secs(5)).await }
        });

        let mut received = Vec::new();
        for _ in 0..2 {
            received.push(parsed(mailbox.next_request().await.unwrap().unwrap()));
        }

        // Answer in an order that differs from arrival for at least one of them.
        received.sort_by(|x, y| y.tool_name.cmp(&x.tool_name));
        for request in &received {
            let allow = request.tool_name == "Write";
            let response = if allow {
                MailboxResponse {
                    request_id: request.request_id.clone(),
                    channel_id: request.channel_id.clone(),
                    allow: true,
                    message: None,
                }
            } else {
                MailboxResponse::deny(request, "Denied by user")
            };
            mailbox.respond(response).await.unwrap();
        }

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.request_id, first.request_id);
        assert!(a.allow);
        assert_eq!(b.request_id, second.request_id);
        assert!(!b.allow);
        assert_eq!(b.message.as_deref(), Some("Denied by user"));
    }

    #[tokio::test]
    async fn test_socket_respond_to_unknown_request_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mailbox = SocketMailbox::bind(temp_dir.path().join("warden.sock"))
            .await
            .unwrap();

        let request = MailboxRequest::new("tab-z", "Write", Map::new());
        let err = mailbox
            .respond(MailboxResponse::deny(&request, "nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No open connection"));
    }

    #[tokio::test]
    async fn test_socket_client_timeout_is_deny() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        let _mailbox = SocketMailbox::bind(&socket_path).await.unwrap();

        let client = SocketMailboxClient::new(&socket_path);
        let response = client
            .request(
                MailboxRequest::new("tab-t", "Bash", Map::new()),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(!response.allow);
        assert_eq!(response.message.as_deref(), Some("Permission request timed out"));
    }

    #[tokio::test]
    async fn test_close_removes_socket_file() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        let mailbox = SocketMailbox::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        mailbox.close();
        assert!(!socket_path.exists());
        assert!(mailbox.next_request().await.unwrap().is_none());
    }
}
