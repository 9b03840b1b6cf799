//! Live session protocol integration tests
//!
//! Runs the session against an in-memory server.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use beacon_live::error::{ConnectionError, ProtocolError};
use beacon_live::live::{FunctionResponse, LiveSession, ServerEvent, SessionState};
use beacon_live::{Error, ToolDeclaration};

mod common;

use common::{MockServer, mock_connector, setup_params};

/// Connect `session`, acknowledging setup from the server side
async fn connect_acked(
    session: &mut LiveSession,
    servers: &mut tokio::sync::mpsc::UnboundedReceiver<MockServer>,
) -> (MockServer, serde_json::Value) {
    let (connected, peer) = tokio::join!(session.connect(setup_params()), async {
        let mut server = servers.recv().await.expect("no connection attempt");
        let setup = server.next_json().await.expect("no setup message");
        server.ack();
        (server, setup)
    });
    connected.expect("connect failed");
    peer
}

#[tokio::test(start_paused = true)]
async fn test_ready_within_half_a_second() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);
    assert_eq!(session.state(), SessionState::Disconnected);

    let started = Instant::now();
    let (_server, setup) = connect_acked(&mut session, &mut servers).await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.id().is_some());
    assert_eq!(setup["setup"]["model"], "models/test-live");
    assert_eq!(
        setup["setup"]["generationConfig"]["responseModalities"],
        json!(["AUDIO"])
    );
    assert_eq!(
        setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Puck"
    );
}

#[tokio::test]
async fn test_setup_declares_tools() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);

    let mut params = setup_params();
    params.tools.push(ToolDeclaration {
        name: "get_weather".to_string(),
        description: "Weather for a city".to_string(),
        parameters: Some(json!({ "type": "object" })),
    });

    let (connected, setup) = tokio::join!(session.connect(params), async {
        let mut server = servers.recv().await.unwrap();
        let setup = server.next_json().await.unwrap();
        server.ack();
        (server, setup)
    });
    connected.unwrap();

    let declarations = &setup.1["setup"]["tools"][0]["functionDeclarations"];
    assert_eq!(declarations[0]["name"], "get_weather");
    assert_eq!(declarations[0]["parameters"]["type"], "object");

    let negotiated = session.params().expect("no negotiated params");
    assert_eq!(negotiated.model, "models/test-live");
    assert_eq!(negotiated.tools.len(), 1);
}

#[tokio::test]
async fn test_sends_before_ready_are_rejected() {
    let (connector, _servers) = mock_connector();
    let mut session = LiveSession::new(connector);

    let err = session.send_text("hello", true).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::NotReady(SessionState::Disconnected))
    ));

    let err = session.send_audio_chunk(&[0u8; 3200]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::NotReady(_))));
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_then_reconnect() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);

    // Server accepts the socket but never acknowledges
    let started = Instant::now();
    let (result, _silent) = tokio::join!(session.connect(setup_params()), async {
        servers.recv().await.expect("no connection attempt")
    });

    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::Timeout(t))) if t == Duration::from_secs(10)
    ));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(session.state(), SessionState::Disconnected);

    let (_server, _) = connect_acked(&mut session, &mut servers).await;
    assert!(session.is_ready());
}

#[tokio::test]
async fn test_sends_after_disconnect_report_closed() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);
    let (_server, _) = connect_acked(&mut session, &mut servers).await;

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);

    let err = session.send_text("anyone there?", true).await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
    let err = session
        .send_tool_responses(vec![FunctionResponse::success(
            "1".into(),
            "noop".into(),
            json!({}),
        )])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
}

#[tokio::test]
async fn test_outbound_messages() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);
    let (mut server, _) = connect_acked(&mut session, &mut servers).await;

    session.send_text("what time is it?", true).await.unwrap();
    assert!(session.turn_in_progress());
    let text = server.next_json().await.unwrap();
    assert_eq!(text["clientContent"]["turnComplete"], true);
    assert_eq!(text["clientContent"]["turns"][0]["role"], "user");
    assert_eq!(
        text["clientContent"]["turns"][0]["parts"][0]["text"],
        "what time is it?"
    );

    session.send_audio_chunk(&[0u8, 1, 2, 3]).await.unwrap();
    let audio = server.next_json().await.unwrap();
    let chunk = &audio["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm");
    assert_eq!(chunk["data"], "AAECAw==");

    session
        .send_tool_responses(vec![
            FunctionResponse::success("a".into(), "get_time".into(), json!({ "time": "noon" })),
            FunctionResponse::failure("b".into(), "fail_always".into(), "broke"),
        ])
        .await
        .unwrap();
    let bundle = server.next_json().await.unwrap();
    let responses = &bundle["toolResponse"]["functionResponses"];
    assert_eq!(responses.as_array().unwrap().len(), 2);
    assert_eq!(responses[0]["response"]["response"]["time"], "noon");
    assert_eq!(responses[1]["response"]["response"]["error"], "broke");
}

#[tokio::test]
async fn test_inbound_events_in_order() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);
    let (server, _) = connect_acked(&mut session, &mut servers).await;
    session.send_text("hi", true).await.unwrap();

    server.send(&json!({
        "serverContent": {
            "modelTurn": { "parts": [
                { "text": "Hello" },
                { "inlineData": { "mimeType": "audio/pcm", "data": "AAA=" } }
            ] },
            "outputTranscription": { "text": "Hello" },
            "turnComplete": true
        }
    }));

    assert_eq!(session.recv().await.unwrap(), ServerEvent::OutputText("Hello".into()));
    assert_eq!(session.recv().await.unwrap(), ServerEvent::OutputAudio(vec![0, 0]));
    assert_eq!(
        session.recv().await.unwrap(),
        ServerEvent::OutputTranscription("Hello".into())
    );
    assert_eq!(session.recv().await.unwrap(), ServerEvent::TurnComplete);
    assert!(!session.turn_in_progress());
    assert_eq!(session.turns_completed(), 1);
}

#[tokio::test]
async fn test_malformed_messages_are_dropped() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);
    let (server, _) = connect_acked(&mut session, &mut servers).await;

    server.send_raw("not json at all");
    server.send(&json!({ "somethingElse": 1 }));
    server.send(&json!({
        "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "image/png", "data": "AAA=" } }
        ] } }
    }));
    server.send(&json!({
        "toolCall": { "functionCalls": [{ "id": "c1", "name": "get_time", "args": {} }] }
    }));

    match session.recv().await.unwrap() {
        ServerEvent::ToolCall(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].id, "c1");
            assert_eq!(calls[0].name, "get_time");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(session.is_ready());
}

#[tokio::test]
async fn test_server_close_ends_session() {
    let (connector, mut servers) = mock_connector();
    let mut session = LiveSession::new(connector);
    let (server, _) = connect_acked(&mut session, &mut servers).await;

    drop(server);

    let err = session.recv().await.unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
    assert_eq!(session.state(), SessionState::Closed);
}
