use crate::io_struct::ConversationMessage;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Stream of generated text chunks, in arrival order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Client for an OpenAI-compatible text-generation backend, pinned to one
/// model identifier from config.
#[derive(Debug, Clone)]
pub struct GenBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

impl GenBackend {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout_secs: u64,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(GenBackend {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Start a streamed generation for `messages` and return the text deltas
    /// as they arrive. Fails before yielding any bytes if the request itself
    /// fails or the backend answers with a non-success status.
    pub async fn stream_text(
        &self,
        messages: &[ConversationMessage],
    ) -> Result<TextStream, BackendError> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, message });
        }
        Ok(delta_stream(Box::pin(resp.bytes_stream())))
    }
}

struct SseState {
    inner: ByteStream,
    buf: Vec<u8>,
}

/// Reassemble SSE lines from a raw byte stream and extract the
/// `choices[0].delta.content` text of each event. Raw bytes are buffered
/// until a newline arrives and only complete lines are decoded, so a
/// multi-byte UTF-8 character split across chunk boundaries passes through
/// intact. Blank lines and unparsable events are skipped without ending the
/// stream. `[DONE]`, a `finish_reason`, or upstream EOF terminates it.
fn delta_stream(inner: ByteStream) -> TextStream {
    let state = SseState {
        inner,
        buf: Vec::new(),
    };
    let stream = futures::stream::try_unfold(state, |mut st| async move {
        loop {
            while let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = st.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim_start();
                if data == "[DONE]" {
                    return Ok(None);
                }
                let Ok(event) = serde_json::from_str::<StreamResponse>(data) else {
                    continue;
                };
                let Some(choice) = event.choices.first() else {
                    continue;
                };
                if let Some(text) = choice.delta.content.as_deref() {
                    if !text.is_empty() {
                        let chunk = Bytes::copy_from_slice(text.as_bytes());
                        return Ok(Some((chunk, st)));
                    }
                }
                if choice.finish_reason.is_some() {
                    return Ok(None);
                }
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(BackendError::Http(e)),
                None => return Ok(None),
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn run(parts: Vec<&'static str>) -> Vec<String> {
        let inner: ByteStream = Box::pin(stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<Result<Bytes, reqwest::Error>>>(),
        ));
        let collected = futures::executor::block_on(
            delta_stream(inner).collect::<Vec<Result<Bytes, BackendError>>>(),
        );
        collected
            .into_iter()
            .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn extracts_deltas_in_order() {
        let out = run(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo!\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert_eq!(out, vec!["Hel", "lo!"]);
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let out = run(vec![
            "data: {\"choices\":[{\"delta\":{\"cont",
            "ent\":\"Hello\"},\"finish_reason\":null}]}\n",
            "\ndata: [DONE]\n",
        ]);
        assert_eq!(out, vec!["Hello"]);
    }

    #[test]
    fn skips_blank_lines_and_unparsable_events() {
        let out = run(vec![
            "\n: keep-alive\n\ndata: not json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":null}]}\n",
            "data: [DONE]\n",
        ]);
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn finish_reason_ends_the_stream() {
        let out = run(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"bye\"},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after\"},\"finish_reason\":null}]}\n",
        ]);
        assert_eq!(out, vec!["bye"]);
    }

    #[test]
    fn multibyte_utf8_split_across_chunks_passes_through_intact() {
        let event =
            "data: {\"choices\":[{\"delta\":{\"content\":\"café\"},\"finish_reason\":null}]}\n\
             data: [DONE]\n"
                .as_bytes();
        // split between the two bytes of 'é'
        let split = event.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok::<_, reqwest::Error>(Bytes::copy_from_slice(&event[..split])),
            Ok(Bytes::copy_from_slice(&event[split..])),
        ]));
        let collected = futures::executor::block_on(
            delta_stream(inner).collect::<Vec<Result<Bytes, BackendError>>>(),
        );
        let text: String = collected
            .into_iter()
            .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
            .collect();
        assert_eq!(text, "café");
    }

    #[test]
    fn upstream_eof_without_done_still_terminates() {
        let out = run(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"},\"finish_reason\":null}]}\n",
        ]);
        assert_eq!(out, vec!["tail"]);
    }
}
