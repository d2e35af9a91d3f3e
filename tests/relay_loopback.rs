//! End-to-end tests against a scripted SMTP relay on the loopback interface.

use integrations_mail_dispatch::mocks::{fixtures, RecordingReporter, RecordingScheduler};
use integrations_mail_dispatch::{DispatchConfig, DispatchErrorKind, Mailer, TlsConfig};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the relay saw during one session.
#[derive(Debug, Default)]
struct Transcript {
    commands: Vec<String>,
    messages: Vec<String>,
}

/// Serves one SMTP session. Recipients starting with `nobody@` are refused.
async fn spawn_relay() -> (u16, JoinHandle<Transcript>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        let mut transcript = Transcript::default();
        let mut queued = 0;

        write.write_all(b"220 loopback ESMTP ready\r\n").await.unwrap();

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let command = line.trim_end().to_string();
            transcript.commands.push(command.clone());

            let reply: &[u8] = if command.starts_with("EHLO") {
                b"250-loopback\r\n250-SIZE 1000000\r\n250 8BITMIME\r\n"
            } else if command.starts_with("RCPT TO:<nobody@") {
                b"550 5.1.1 No such user\r\n"
            } else if command == "DATA" {
                write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await.unwrap();
                let mut body = String::new();
                loop {
                    let mut data = String::new();
                    reader.read_line(&mut data).await.unwrap();
                    if data == ".\r\n" {
                        break;
                    }
                    body.push_str(&data);
                }
                transcript.messages.push(body);
                queued += 1;
                let reply = format!("250 2.0.0 Ok: queued as LOOP{}\r\n", queued);
                write.write_all(reply.as_bytes()).await.unwrap();
                continue;
            } else if command == "QUIT" {
                write.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
                break;
            } else {
                b"250 2.0.0 Ok\r\n"
            };
            write.write_all(reply).await.unwrap();
        }

        transcript
    });

    (port, handle)
}

fn mailer(port: u16, scheduler: &RecordingScheduler, reporter: &RecordingReporter) -> Mailer {
    let config = DispatchConfig::builder()
        .relay_host("127.0.0.1")
        .relay_port(port)
        .connect_timeout(Duration::from_secs(2))
        .command_timeout(Duration::from_secs(2))
        .client_id("dispatch.test")
        .max_retries(3)
        .build()
        .unwrap();

    Mailer::builder()
        .config(config)
        .scheduler(Arc::new(scheduler.clone()))
        .reporter(Arc::new(reporter.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_batch_over_one_session() {
    let (port, relay) = spawn_relay().await;
    let scheduler = RecordingScheduler::new();
    let reporter = RecordingReporter::new();
    let mailer = mailer(port, &scheduler, &reporter);

    let report = mailer
        .send_messages(vec![
            fixtures::message(&["a@example.com"]),
            fixtures::message(&["nobody@example.com", "b@example.com"]),
            fixtures::message(&["nobody@example.com"]),
        ])
        .await;

    let transcript = relay.await.unwrap();

    assert_eq!(report.delivered.len(), 2);
    assert_eq!(report.scheduled_count(), 1);
    assert_eq!(report.scheduled[0].delay, Duration::from_secs(30));

    let failed = &report.scheduled[0].attempts[0];
    assert_eq!(failed.attempt_count(), 1);
    assert_eq!(failed.errors()[0].kind, DispatchErrorKind::RecipientsRejected);
    assert_eq!(failed.errors()[0].smtp_code, Some(550));

    assert_eq!(transcript.commands[0], "EHLO dispatch.test");
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
    assert_eq!(
        transcript.commands.iter().filter(|c| *c == "RSET").count(),
        1
    );
    assert_eq!(transcript.messages.len(), 2);
    assert!(transcript.messages[0].contains("Hello from the fixtures."));

    let snapshot = mailer.metrics().snapshot();
    assert_eq!(snapshot.connections_successful, 1);
    assert_eq!(snapshot.messages_delivered, 2);
    assert!(reporter.reported().is_empty());
}

#[tokio::test]
async fn test_refused_connection_schedules_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let scheduler = RecordingScheduler::new();
    let mailer = mailer(port, &scheduler, &RecordingReporter::new());

    let report = mailer
        .send_messages(vec![
            fixtures::message(&["a@example.com"]),
            fixtures::message(&["b@example.com"]),
        ])
        .await;

    assert_eq!(report.scheduled_count(), 2);
    let scheduled = scheduler.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert!(scheduled[0]
        .1
        .iter()
        .all(|a| a.errors()[0].kind == DispatchErrorKind::ConnectionRefused));
    assert_eq!(mailer.metrics().snapshot().connections_failed, 1);
}

#[tokio::test]
async fn test_dropped_greeting_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let scheduler = RecordingScheduler::new();
    let mailer = mailer(port, &scheduler, &RecordingReporter::new());

    let report = mailer
        .send_messages(vec![fixtures::message(&["a@example.com"])])
        .await;
    relay.await.unwrap();

    assert_eq!(report.scheduled_count(), 1);
    assert_eq!(
        report.scheduled[0].attempts[0].errors()[0].kind,
        DispatchErrorKind::ConnectionReset
    );
}

#[cfg(feature = "rustls-tls")]
#[tokio::test]
async fn test_missing_ca_file_fails_at_construction() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = DispatchConfig::builder()
        .relay_host("127.0.0.1")
        .relay_port(port)
        .implicit_tls(true)
        .tls(TlsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        })
        .max_retries(5)
        .build()
        .unwrap();

    let err = Mailer::builder()
        .config(config)
        .scheduler(Arc::new(RecordingScheduler::new()))
        .build()
        .unwrap_err();

    assert_eq!(err.kind(), DispatchErrorKind::ConfigurationInvalid);
    assert!(err.message().contains("/nonexistent/ca.pem"));

    let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
    assert!(accepted.is_err());
}
