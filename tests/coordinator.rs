//! Turn coordinator integration tests
//!
//! Drives the full dispatch loop against a mock server, a recording speaker
//! and a channel-fed microphone. Timers run on tokio's paused clock.

use std::time::Duration;

use serde_json::json;

use beacon_live::error::ConnectionError;
use beacon_live::live::SessionState;
use beacon_live::{Error, Result};

mod common;

use common::{RecordingRenderer, settle_briefly, start_coordinator};

const WAIT: Duration = Duration::from_millis(50);

/// Push one full microphone frame
async fn speak(mic: &tokio::sync::mpsc::Sender<Result<Vec<u8>>>) {
    mic.send(Ok(vec![0u8; 3_200])).await.expect("mic closed");
}

#[tokio::test(start_paused = true)]
async fn test_fragments_coalesce_into_one_chunk() {
    let h = start_coordinator(RecordingRenderer::default(), false).await;

    h.server.send_audio(20_000);
    h.server.send_audio(20_000);
    h.server.send_audio(20_000);
    settle_briefly().await;
    assert_eq!(h.renderer.started(), vec![60_000]);

    h.server.send_turn_complete();
    settle_briefly().await;
    assert_eq!(h.renderer.started(), vec![60_000]);

    h.shutdown.send(()).await.unwrap();
    let (coordinator, result) = h.run.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(coordinator.session().state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_small_fragments_flush_after_debounce() {
    let h = start_coordinator(RecordingRenderer::default(), false).await;

    h.server.send_audio(1_000);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.server.send_audio(1_000);
    tokio::time::sleep(Duration::from_millis(60)).await;
    // Second fragment restarted the 100 ms debounce
    assert!(h.renderer.started().is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.renderer.started(), vec![2_000]);
}

#[tokio::test(start_paused = true)]
async fn test_fragments_across_a_gap_flush_separately() {
    let h = start_coordinator(RecordingRenderer::default(), false).await;

    h.server.send_audio(1_000);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.renderer.started(), vec![1_000]);

    h.server.send_audio(1_000);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.renderer.started(), vec![1_000, 1_000]);
}

#[tokio::test(start_paused = true)]
async fn test_turn_complete_flushes_remainder() {
    let h = start_coordinator(RecordingRenderer::default(), false).await;

    h.server.send_audio(50_000);
    h.server.send_audio(7_000);
    h.server.send_turn_complete();
    settle_briefly().await;

    assert_eq!(h.renderer.started(), vec![50_000, 7_000]);
    assert_eq!(h.observer.events(), vec!["turn_complete"]);
}

#[tokio::test(start_paused = true)]
async fn test_mic_paused_while_speaking_then_settles() {
    let renderer = RecordingRenderer::with_delay(Duration::from_millis(200));
    let mut h = start_coordinator(renderer, true).await;
    let mic = h.mic.clone().unwrap();

    speak(&mic).await;
    assert!(h.server.next_of_kind("realtimeInput", WAIT).await.is_some());

    h.server.send_audio(4_800);
    settle_briefly().await;
    speak(&mic).await;
    assert!(h.server.next_within(WAIT).await.is_none(), "mic leaked while model speaks");

    // Playback of the flushed remainder takes 200 ms, then 300 ms of settle
    h.server.send_turn_complete();
    tokio::time::sleep(Duration::from_millis(300)).await;
    speak(&mic).await;
    assert!(h.server.next_within(WAIT).await.is_none(), "mic resumed before settle");

    tokio::time::sleep(Duration::from_millis(400)).await;
    speak(&mic).await;
    assert!(h.server.next_of_kind("realtimeInput", WAIT).await.is_some());
    assert_eq!(h.renderer.finished(), vec![4_800]);
}

#[tokio::test(start_paused = true)]
async fn test_unplayable_part_still_completes_turn() {
    let mut h = start_coordinator(RecordingRenderer::default(), true).await;
    let mic = h.mic.clone().unwrap();

    h.server.send_audio(4_800);
    settle_briefly().await;
    speak(&mic).await;
    assert!(h.server.next_within(WAIT).await.is_none());

    h.server.send(&json!({
        "serverContent": {
            "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": "iVBORw==" } }
            ] },
            "turnComplete": true
        }
    }));
    tokio::time::sleep(Duration::from_millis(400)).await;

    speak(&mic).await;
    assert!(h.server.next_of_kind("realtimeInput", WAIT).await.is_some());
    assert_eq!(h.renderer.started(), vec![4_800]);
    assert_eq!(h.observer.events(), vec!["turn_complete"]);
}

#[tokio::test(start_paused = true)]
async fn test_text_only_turn_leaves_mic_alone() {
    let mut h = start_coordinator(RecordingRenderer::default(), true).await;
    let mic = h.mic.clone().unwrap();

    h.server.send(&json!({
        "serverContent": { "modelTurn": { "parts": [{ "text": "ok" }] }, "turnComplete": true }
    }));
    settle_briefly().await;

    speak(&mic).await;
    assert!(h.server.next_of_kind("realtimeInput", WAIT).await.is_some());
    assert_eq!(h.observer.events(), vec!["text:ok", "turn_complete"]);
}

#[tokio::test(start_paused = true)]
async fn test_tool_results_bundled_then_failsafe_resumes() {
    let mut h = start_coordinator(RecordingRenderer::default(), true).await;
    let mic = h.mic.clone().unwrap();

    let declared = &h.setup["setup"]["tools"][0]["functionDeclarations"];
    assert_eq!(declared.as_array().map(Vec::len), Some(2));

    h.server.send_audio(4_800);
    h.server.send(&json!({
        "toolCall": { "functionCalls": [
            { "id": "t1", "name": "get_time", "args": { "tz": "UTC" } },
            { "id": "t2", "name": "fail_always", "args": {} }
        ] }
    }));

    let bundle = h
        .server
        .next_of_kind("toolResponse", Duration::from_secs(1))
        .await
        .expect("no tool response");
    let responses = bundle["toolResponse"]["functionResponses"].as_array().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], "t1");
    assert_eq!(responses[0]["response"]["response"]["tool"], "get_time");
    assert_eq!(responses[1]["id"], "t2");
    assert!(
        responses[1]["response"]["response"]["error"]
            .as_str()
            .is_some_and(|e| e.contains("fail_always broke"))
    );

    // Still paused one second later, and nothing else was sent
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    speak(&mic).await;
    assert!(h.server.next_within(WAIT).await.is_none());

    // No follow-on audio: the failsafe resumes listening at 2 s
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    speak(&mic).await;
    assert!(h.server.next_of_kind("realtimeInput", WAIT).await.is_some());

    let mut calls = h.tools.calls.lock().unwrap().clone();
    calls.sort();
    assert_eq!(calls, ["fail_always", "get_time"]);
    assert!(h.observer.events().contains(&"tool_call:2".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_follow_on_audio_cancels_failsafe() {
    let mut h = start_coordinator(RecordingRenderer::default(), true).await;
    let mic = h.mic.clone().unwrap();

    h.server.send_audio(4_800);
    h.server.send(&json!({
        "toolCall": { "functionCalls": [{ "id": "t1", "name": "get_time", "args": {} }] }
    }));
    assert!(
        h.server
            .next_of_kind("toolResponse", Duration::from_secs(1))
            .await
            .is_some()
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    h.server.send_audio(4_800);

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    speak(&mic).await;
    assert!(h.server.next_within(WAIT).await.is_none(), "failsafe fired during answer");

    h.server.send_turn_complete();
    tokio::time::sleep(Duration::from_millis(400)).await;
    speak(&mic).await;
    assert!(h.server.next_of_kind("realtimeInput", WAIT).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_interruption_drops_queued_output() {
    let h = start_coordinator(RecordingRenderer::with_delay(Duration::from_secs(5)), false).await;

    h.server.send_audio(60_000);
    h.server.send_audio(60_000);
    h.server.send_audio(1_000);
    settle_briefly().await;
    assert_eq!(h.renderer.started(), vec![60_000]);

    h.server.send_interrupted();
    settle_briefly().await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(h.renderer.started(), vec![60_000]);
    assert!(h.renderer.finished().is_empty());
    assert_eq!(h.observer.events(), vec!["interrupted"]);
}

#[tokio::test(start_paused = true)]
async fn test_text_turn_and_end_of_input() {
    let mut h = start_coordinator(RecordingRenderer::default(), false).await;

    h.input.send("  hello there ".to_string()).await.unwrap();
    let turn = h
        .server
        .next_of_kind("clientContent", Duration::from_secs(1))
        .await
        .expect("no text turn");
    assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], "hello there");
    assert_eq!(turn["clientContent"]["turnComplete"], true);

    // End of input waits for the open turn
    drop(h.input);
    settle_briefly().await;
    assert!(!h.run.is_finished());

    h.server.send(&json!({
        "serverContent": { "modelTurn": { "parts": [{ "text": "Hi!" }] }, "turnComplete": true }
    }));

    let (coordinator, result) = h.run.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(coordinator.session().turns_completed(), 1);
    assert_eq!(h.observer.events(), vec!["text:Hi!", "turn_complete"]);
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_disables_listening_only() {
    let mut h = start_coordinator(RecordingRenderer::default(), true).await;
    let mic = h.mic.take().unwrap();

    mic.send(Err(Error::Capture("unplugged".to_string()))).await.unwrap();
    settle_briefly().await;
    assert!(
        h.observer
            .events()
            .iter()
            .any(|e| e.starts_with("capture_error:") && e.contains("unplugged"))
    );

    h.input.send("still here".to_string()).await.unwrap();
    assert!(
        h.server
            .next_of_kind("clientContent", Duration::from_secs(1))
            .await
            .is_some()
    );
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_ends_run() {
    let h = start_coordinator(RecordingRenderer::default(), true).await;

    drop(h.server);

    let (coordinator, result) = h.run.await.unwrap();
    assert!(matches!(result, Err(Error::Connection(ConnectionError::Closed))));
    assert_eq!(coordinator.session().state(), SessionState::Closed);
    assert!(!coordinator.is_listening());
}

#[tokio::test(start_paused = true)]
async fn test_mic_failure_after_input_closed_ends_run() {
    let mut h = start_coordinator(RecordingRenderer::default(), true).await;
    let mic = h.mic.take().unwrap();

    // The mic alone keeps the session going
    drop(h.input);
    settle_briefly().await;
    assert!(!h.run.is_finished());

    mic.send(Err(Error::Capture("unplugged".to_string()))).await.unwrap();

    let (coordinator, result) = h.run.await.unwrap();
    assert!(result.is_ok());
    assert!(!coordinator.is_listening());
    assert_eq!(coordinator.session().state(), SessionState::Closed);
}
