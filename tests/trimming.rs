//! Completion client behavior against a mock completion server:
//! oldest-first trimming, exhaustion, and the streaming update sequence.

use std::sync::Mutex;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use gptgram::bot::completion::StreamUpdate;
use gptgram::bot::registry::Registry;
use gptgram::bot::{CompletionClient, CompletionError, Turn, UserContent, UserInput};

fn history(n: usize) -> Vec<Turn> {
    (0..n)
        .map(|i| Turn::new(UserContent::text(format!("turn-{i}")), format!("answer-{i}")))
        .collect()
}

fn overflow_body() -> serde_json::Value {
    json!({
        "error": {
            "message": "This model's maximum context length is 4096 tokens.",
            "type": "invalid_request_error",
            "code": "context_length_exceeded"
        }
    })
}

/// Rejects with a context-overflow error until the prompt is short enough,
/// then answers. Remembers the last accepted prompt.
struct OverflowUntil {
    max_messages: usize,
    accepted: Mutex<Option<serde_json::Value>>,
    success: ResponseTemplate,
}

impl OverflowUntil {
    fn new(max_messages: usize, success: ResponseTemplate) -> Self {
        Self {
            max_messages,
            accepted: Mutex::new(None),
            success,
        }
    }
}

impl Respond for OverflowUntil {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let n_messages = body["messages"].as_array().unwrap().len();
        if n_messages > self.max_messages {
            ResponseTemplate::new(400).set_body_json(overflow_body())
        } else {
            *self.accepted.lock().unwrap() = Some(body);
            self.success.clone()
        }
    }
}

fn whole_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "  final answer  "},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 42, "completion_tokens": 7}
    }))
}

fn sse_response(deltas: &[&str]) -> ResponseTemplate {
    let mut body = String::new();
    for delta in deltas {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"id": "x", "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]})
        ));
    }
    body.push_str("data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn client_for(server: &MockServer) -> CompletionClient {
    CompletionClient::new("sk-test".to_string(), server.uri())
}

fn assistant_mode() -> gptgram::bot::registry::ChatMode {
    Registry::default().chat_mode("assistant").unwrap().clone()
}

#[tokio::test]
async fn whole_mode_trims_oldest_first_until_accepted() {
    let server = MockServer::start().await;
    // Prompt = system + 2 per turn + input; accept at most 2 turns of history
    let responder = OverflowUntil::new(2 + 2 * 2, whole_response());
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let completion = client
        .send_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("newest question"),
            &history(6),
        )
        .await
        .unwrap();

    // 6 turns, 2 survive: exactly the 4 oldest were dropped
    assert_eq!(completion.n_trimmed, 4);
    assert_eq!(completion.answer, "final answer");
    assert_eq!(completion.usage.n_input_tokens, 42);
    assert_eq!(completion.usage.n_output_tokens, 7);

    // One rejected attempt per trimmed turn plus the accepted one
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn whole_mode_keeps_newest_turns() {
    let server = MockServer::start().await;
    let responder = std::sync::Arc::new(OverflowUntil::new(2 + 2 * 2, whole_response()));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ArcRespond(responder.clone()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .send_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("newest question"),
            &history(6),
        )
        .await
        .unwrap();

    let accepted = responder.accepted.lock().unwrap().clone().unwrap();
    let messages = accepted["messages"].as_array().unwrap().clone();
    // system, turn-4 pair, turn-5 pair, new input
    assert_eq!(messages.len(), 6);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "turn-4");
    assert_eq!(messages[2]["content"], "answer-4");
    assert_eq!(messages[3]["content"], "turn-5");
    assert_eq!(messages[4]["content"], "answer-5");
    assert_eq!(messages[5]["content"], "newest question");
}

/// Respond wrapper so a shared responder can be inspected after the call.
struct ArcRespond(std::sync::Arc<OverflowUntil>);

impl Respond for ArcRespond {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.0.respond(request)
    }
}

#[tokio::test]
async fn empty_history_overflow_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(overflow_body()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .send_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("question"),
            &history(2),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::ContextExhausted));
    // Two trims, then one last attempt with no history left
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn non_overflow_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .send_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("question"),
            &history(3),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::Api { status: 429, .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn streaming_yields_partials_then_one_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&["Hello", " wor", "ld"]))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut stream = client
        .stream_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("hi"),
            &[],
        )
        .await
        .unwrap();

    let mut partials = Vec::new();
    let mut terminal = None;
    while let Some(update) = stream.next().await.unwrap() {
        match update {
            StreamUpdate::Partial { answer, usage } => {
                assert!(usage.n_input_tokens > 0);
                assert!(usage.n_output_tokens > 0);
                partials.push(answer);
            }
            StreamUpdate::Finished {
                answer,
                n_trimmed,
                ..
            } => {
                assert!(terminal.is_none(), "terminal update must be unique");
                assert_eq!(n_trimmed, 0);
                terminal = Some(answer);
            }
        }
    }

    assert!(!partials.is_empty());
    // Partial answers grow monotonically toward the final text
    for pair in partials.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }
    assert_eq!(terminal.as_deref(), Some("Hello world"));

    // The stream is exhausted after the terminal update
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn streaming_trims_before_first_delta() {
    let server = MockServer::start().await;
    let responder = OverflowUntil::new(2 + 2 * 1, sse_response(&["ok"]));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut stream = client
        .stream_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("hi"),
            &history(4),
        )
        .await
        .unwrap();

    assert_eq!(stream.n_trimmed(), 3);

    let mut n_trimmed_reported = None;
    while let Some(update) = stream.next().await.unwrap() {
        if let StreamUpdate::Finished { n_trimmed, .. } = update {
            n_trimmed_reported = Some(n_trimmed);
        }
    }
    assert_eq!(n_trimmed_reported, Some(3));
}

#[tokio::test]
async fn streaming_exhaustion_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(overflow_body()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .stream_chat(
            "gpt-4o",
            &assistant_mode(),
            &UserInput::text("hi"),
            &history(1),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CompletionError::ContextExhausted));
}
