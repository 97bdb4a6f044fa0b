/// End-to-end tests through the session router.
///
/// Each test drives `Session::handle` with JSON envelopes and reads replies
/// off the outbound channel, the same way the WebSocket transport does:
///   authenticate → create highlight → chat → merge → list / navigate
use std::sync::Arc;
use std::time::Duration;

use docthread::AppContext;
use docthread::config::Config;
use docthread::db::Db;
use docthread::db::models::StoredDocument;
use docthread::generation::ScriptedGenerator;
use docthread::session::{Envelope, Session};
use serde_json::{Value, json};
use tokio::sync::mpsc::Receiver;

const FIRST_CHUNK: &str = "The committee met on Tuesday to review the harbour proposal. \
     Members raised concerns about dredging costs, tidal flow and the schedule for public consultation.";

async fn setup(generator: ScriptedGenerator) -> (AppContext, StoredDocument) {
    setup_with(generator, false).await
}

async fn setup_with(generator: ScriptedGenerator, summarize: bool) -> (AppContext, StoredDocument) {
    let mut config = Config::default();
    config.merge.summarize = summarize;
    let ctx = AppContext::new(
        Db::open_in_memory().unwrap().shared(),
        config,
        Arc::new(generator),
    );
    let chunks = vec![
        FIRST_CHUNK.to_string(),
        "A second section on budgets.".to_string(),
        "A closing section with recommendations.".to_string(),
    ];
    assert!(chunks[0].chars().count() >= 100);
    let stored = ctx
        .db
        .lock()
        .await
        .insert_document("Harbour minutes", &chunks)
        .unwrap();
    (ctx, stored)
}

async fn active_session(ctx: &AppContext, document_id: &str) -> (Session, Receiver<Envelope>) {
    let (mut session, mut rx) = Session::new(ctx.clone(), document_id);
    session.handle(request("session.demo", json!({}))).await;
    assert_eq!(next(&mut rx).await.kind, "session.demo.completed");
    (session, rx)
}

fn request(kind: &str, data: Value) -> Envelope {
    Envelope::new(kind, data)
}

async fn next(rx: &mut Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("outbound channel closed")
}

/// Reads events until the first non-token event, collecting streamed tokens.
async fn until_terminal(rx: &mut Receiver<Envelope>, tokens: &mut String) -> Envelope {
    loop {
        let event = next(rx).await;
        if event.kind != "chat.token" {
            return event;
        }
        tokens.push_str(event.data["token"].as_str().unwrap());
    }
}

async fn message_count(session: &mut Session, rx: &mut Receiver<Envelope>, conversation_id: &str) -> usize {
    session
        .handle(request(
            "conversation.messages.get",
            json!({ "conversation_id": conversation_id }),
        ))
        .await;
    let reply = next(rx).await;
    assert_eq!(reply.kind, "conversation.messages.get.completed");
    reply.data["messages"].as_array().unwrap().len()
}

/// Highlight → chat → merge into main → second merge rejected.
#[tokio::test]
async fn test_highlight_chat_and_merge() {
    let (ctx, stored) = setup(ScriptedGenerator::with_reply("It concerns the harbour budget.")).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;

    // 1. Highlight the first 100 chars of chunk 0
    session
        .handle(request(
            "conversation.chunk.create",
            json!({ "chunk_id": stored.chunks[0].id, "range": [0, 100] }),
        ))
        .await;
    let created = next(&mut rx).await;
    assert_eq!(created.kind, "conversation.chunk.create.completed");
    let highlight = &created.data["conversation"];
    let highlight_id = highlight["id"].as_str().unwrap().to_string();
    let expected: String = FIRST_CHUNK.chars().take(100).collect();
    assert_eq!(highlight["highlighted_text"], expected.as_str());
    assert_eq!(highlight["kind"], "chunk");
    assert_eq!(highlight["merged"], false);

    // 2. Chat in the highlight conversation
    session
        .handle(
            request(
                "conversation.message.send",
                json!({
                    "conversation_id": highlight_id,
                    "content": "What is this about?",
                    "conversation_type": "chunk",
                }),
            )
            .with_request_id(Some("send-1".into())),
        )
        .await;
    let mut tokens = String::new();
    let done = until_terminal(&mut rx, &mut tokens).await;
    assert_eq!(done.kind, "conversation.message.send.completed");
    assert_eq!(done.request_id.as_deref(), Some("send-1"));
    assert_eq!(tokens, "It concerns the harbour budget.");
    assert_eq!(done.data["message"]["content"], tokens.as_str());
    assert_eq!(done.data["message"]["role"], "assistant");
    assert_eq!(done.data["user_message"]["sequence"], 0);
    assert_eq!(done.data["message"]["sequence"], 1);

    // 3. Merge into main
    let before = message_count(&mut session, &mut rx, &main_id).await;
    session
        .handle(request(
            "conversation.chunk.merge",
            json!({
                "main_conversation_id": main_id,
                "highlight_conversation_id": highlight_id,
            }),
        ))
        .await;
    let merged = next(&mut rx).await;
    assert_eq!(merged.kind, "conversation.chunk.merge.completed");
    assert_eq!(merged.data["conversation"]["merged"], true);
    assert_eq!(merged.data["conversation"]["merged_into"], main_id.as_str());
    let message = &merged.data["message"];
    assert_eq!(message["role"], "user");
    assert_eq!(message["sequence"], before);
    assert_eq!(message["provenance"]["source_conversation_id"], highlight_id.as_str());
    assert_eq!(message["provenance"]["highlighted_text"], expected.as_str());
    assert!(
        message["content"]
            .as_str()
            .unwrap()
            .contains("It concerns the harbour budget.")
    );
    assert_eq!(message_count(&mut session, &mut rx, &main_id).await, before + 1);

    // 4. A second merge of the same pair changes nothing
    session
        .handle(request(
            "conversation.chunk.merge",
            json!({
                "main_conversation_id": main_id,
                "highlight_conversation_id": highlight_id,
            }),
        ))
        .await;
    let again = next(&mut rx).await;
    assert_eq!(again.kind, "conversation.chunk.merge.error");
    assert_eq!(again.data["code"], "already_merged");
    assert_eq!(message_count(&mut session, &mut rx, &main_id).await, before + 1);

    // 5. The listing reflects the merge
    session
        .handle(request("conversation.list", json!({ "document_id": stored.document.id })))
        .await;
    let listing = next(&mut rx).await;
    assert_eq!(listing.data["conversations"][&highlight_id]["merged"], true);
    assert_eq!(listing.data["conversations"].as_object().unwrap().len(), 2);
    assert_eq!(listing.data["count"], 2);
}

/// With summaries on, the merge message carries the generated summary
/// instead of the transcript.
#[tokio::test]
async fn test_summarized_merge() {
    let summary = "Dredging costs dominate the harbour budget.";
    let (ctx, stored) = setup_with(ScriptedGenerator::with_reply(summary), true).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;

    // 1. Highlight and chat once
    session
        .handle(request(
            "conversation.chunk.create",
            json!({ "chunk_id": stored.chunks[0].id, "range": [4, 13] }),
        ))
        .await;
    let created = next(&mut rx).await;
    let highlight_id = created.data["conversation"]["id"].as_str().unwrap().to_string();
    session
        .handle(request(
            "conversation.message.send",
            json!({ "conversation_id": highlight_id, "content": "Who met?" }),
        ))
        .await;
    let mut tokens = String::new();
    let done = until_terminal(&mut rx, &mut tokens).await;
    assert_eq!(done.kind, "conversation.message.send.completed");

    // 2. Merge: the body is the summary, not a transcript
    let before = message_count(&mut session, &mut rx, &main_id).await;
    let merge = json!({
        "main_conversation_id": main_id,
        "highlight_conversation_id": highlight_id,
    });
    session
        .handle(request("conversation.chunk.merge", merge.clone()))
        .await;
    let merged = next(&mut rx).await;
    assert_eq!(merged.kind, "conversation.chunk.merge.completed");
    assert_eq!(
        merged.data["message"]["content"],
        format!("[Merged from a conversation about \"committee\"]\n{summary}").as_str()
    );
    assert_eq!(merged.data["conversation"]["merged"], true);

    // 3. Merging again is rejected
    session
        .handle(request("conversation.chunk.merge", merge))
        .await;
    let again = next(&mut rx).await;
    assert_eq!(again.kind, "conversation.chunk.merge.error");
    assert_eq!(again.data["code"], "already_merged");
    assert_eq!(message_count(&mut session, &mut rx, &main_id).await, before + 1);
}

#[tokio::test]
async fn test_concurrent_send_is_rejected_as_busy() {
    let generator = ScriptedGenerator::with_reply("one two three four")
        .with_token_delay(Duration::from_millis(20));
    let (ctx, stored) = setup(generator).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;

    let send = json!({ "conversation_id": main_id, "content": "first" });
    session.handle(request("conversation.message.send", send.clone())).await;
    session.handle(request("conversation.message.send", send)).await;

    let mut tokens = String::new();
    let mut busy_seen = false;
    let done = loop {
        let event = until_terminal(&mut rx, &mut tokens).await;
        if event.kind == "conversation.message.send.error" {
            assert_eq!(event.data["code"], "conversation_busy");
            assert_eq!(event.data["conversation_id"], main_id.as_str());
            busy_seen = true;
            continue;
        }
        break event;
    };
    assert!(busy_seen);
    assert_eq!(done.kind, "conversation.message.send.completed");
    assert_eq!(tokens, "one two three four");
    assert!(!ctx.busy.is_busy(&main_id));
    assert_eq!(message_count(&mut session, &mut rx, &main_id).await, 2);
}

#[tokio::test]
async fn test_busy_flag_is_shared_across_sessions() {
    let generator = ScriptedGenerator::with_reply("slow reply here")
        .with_token_delay(Duration::from_millis(30));
    let (ctx, stored) = setup(generator).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut first, mut first_rx) = active_session(&ctx, &stored.document.id).await;
    let (mut second, mut second_rx) = active_session(&ctx, &stored.document.id).await;

    let send = json!({ "conversation_id": main_id, "content": "hello" });
    first.handle(request("conversation.message.send", send.clone())).await;
    second.handle(request("conversation.message.send", send)).await;

    let rejected = next(&mut second_rx).await;
    assert_eq!(rejected.data["code"], "conversation_busy");

    let mut tokens = String::new();
    let done = until_terminal(&mut first_rx, &mut tokens).await;
    assert_eq!(done.kind, "conversation.message.send.completed");
}

#[tokio::test]
async fn test_cancel_discards_turn() {
    let generator = ScriptedGenerator::with_reply("a b c d e f g h")
        .with_token_delay(Duration::from_millis(50));
    let (ctx, stored) = setup(generator).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;

    session
        .handle(request(
            "conversation.message.send",
            json!({ "conversation_id": main_id, "content": "go" }),
        ))
        .await;
    session
        .handle(request(
            "conversation.message.cancel",
            json!({ "conversation_id": main_id }),
        ))
        .await;

    let mut tokens = String::new();
    let ack = until_terminal(&mut rx, &mut tokens).await;
    assert_eq!(ack.kind, "conversation.message.cancel.completed");
    assert_eq!(ack.data["cancelled"], true);

    let terminal = until_terminal(&mut rx, &mut tokens).await;
    assert_eq!(terminal.kind, "conversation.message.send.error");
    assert_eq!(terminal.data["code"], "cancelled");
    assert!(!ctx.busy.is_busy(&main_id));
    assert_eq!(message_count(&mut session, &mut rx, &main_id).await, 0);
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_turns() {
    let generator = ScriptedGenerator::with_reply("never finished at all")
        .with_token_delay(Duration::from_millis(50));
    let (ctx, stored) = setup(generator).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut session, _rx) = active_session(&ctx, &stored.document.id).await;

    session
        .handle(request(
            "conversation.message.send",
            json!({ "conversation_id": main_id, "content": "go" }),
        ))
        .await;
    assert!(ctx.busy.is_busy(&main_id));
    drop(session);

    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.busy.is_busy(&main_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("turn was not cancelled");
    assert!(ctx.messages().list(&main_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_navigation_through_session() {
    let (ctx, stored) = setup(ScriptedGenerator::default()).await;
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;
    let ids: Vec<&str> = stored.chunks.iter().map(|c| c.id.as_str()).collect();

    session.handle(request("document.chunk.list", json!({}))).await;
    let list = next(&mut rx).await;
    let sequences: Vec<i64> = list.data["chunks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["sequence"].as_i64().unwrap())
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    let navigate = |chunk_id: &str| request("document.chunk.navigate", json!({ "chunk_id": chunk_id }));

    session.handle(navigate(ids[0])).await;
    let first = next(&mut rx).await;
    assert!(first.data["navigation"]["prev"].is_null());
    assert_eq!(first.data["navigation"]["next"]["id"], ids[1]);

    session.handle(navigate(ids[1])).await;
    let middle = next(&mut rx).await;
    assert_eq!(middle.data["current"]["id"], ids[1]);
    assert_eq!(middle.data["navigation"]["prev"]["id"], ids[0]);
    assert_eq!(middle.data["navigation"]["next"]["id"], ids[2]);

    session.handle(navigate(ids[2])).await;
    let last = next(&mut rx).await;
    assert!(last.data["navigation"]["next"].is_null());

    session.handle(navigate("missing")).await;
    let missing = next(&mut rx).await;
    assert_eq!(missing.kind, "document.chunk.navigate.error");
    assert_eq!(missing.data["code"], "not_found");
}

#[tokio::test]
async fn test_invalid_ranges_are_rejected() {
    let (ctx, stored) = setup(ScriptedGenerator::default()).await;
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;
    let chunk_id = &stored.chunks[1].id;

    for range in [json!([5, 5]), json!([-1, 3]), json!([0, 10_000])] {
        session
            .handle(request(
                "conversation.chunk.create",
                json!({ "chunk_id": chunk_id, "range": range }),
            ))
            .await;
        let reply = next(&mut rx).await;
        assert_eq!(reply.kind, "conversation.chunk.create.error");
        assert_eq!(reply.data["code"], "invalid_range", "range {range}");
    }
}

#[tokio::test]
async fn test_question_generation_persists_nothing() {
    let (ctx, stored) =
        setup(ScriptedGenerator::with_reply("1. Who chaired?\n2. What did it cost?")).await;
    let main_id = stored.main_conversation.id.clone();
    let (mut session, mut rx) = active_session(&ctx, &stored.document.id).await;

    session
        .handle(request(
            "conversation.questions.generate",
            json!({ "conversation_id": main_id, "count": 2 }),
        ))
        .await;
    let reply = next(&mut rx).await;
    assert_eq!(reply.kind, "conversation.questions.generate.completed");
    assert_eq!(reply.data["questions"], json!(["Who chaired?", "What did it cost?"]));
    assert_eq!(message_count(&mut session, &mut rx, &main_id).await, 0);
}
