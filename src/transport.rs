//! http plumbing for streamed chat completions.
//!
//! - native: `ureq` is blocking, so the request runs on its own worker thread and
//!   forwards body chunks through a bounded `flume` channel.
//! - wasm: `gloo-net` issues the fetch and the body is read through the browser's
//!   `ReadableStreamDefaultReader`, yielding to the event loop between chunks.

use std::sync::Arc;

use async_trait::async_trait;
use flume::Receiver;

use crate::decoder::{BoxedSource, ChunkSource};
use crate::error::RequestError;
use crate::prompt::ChatCompletionRequest;

/// opens one streamed chat-completion request.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait ChatTransport: Send + Sync {
    /// issue the request; `Ok` means a success status and a readable body.
    async fn open(
        &self,
        url: &str,
        api_key: &str,
        body: &ChatCompletionRequest,
    ) -> Result<BoxedSource, RequestError>;
}

/// the transport for the current platform.
pub fn default_transport() -> Arc<dyn ChatTransport> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        Arc::new(UreqTransport::default())
    }
    #[cfg(target_arch = "wasm32")]
    {
        Arc::new(FetchTransport)
    }
}

/// body chunks delivered over a channel. closing drops the receiver, which tells the
/// producer to stop and release its connection.
pub struct ChannelSource {
    rx: Option<Receiver<Result<Vec<u8>, RequestError>>>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Result<Vec<u8>, RequestError>>) -> Self {
        Self { rx: Some(rx) }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl ChunkSource for ChannelSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RequestError> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };
        match rx.recv_async().await {
            Ok(Ok(bytes)) => Ok(Some(bytes)),
            Ok(Err(err)) => Err(err),
            // producer hung up: body exhausted
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.rx = None;
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::UreqTransport;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::io::{ErrorKind as IoErrorKind, Read};

    use bevy::log::{debug, info, warn};

    use super::*;

    const CHUNK_SIZE: usize = 8 * 1024;
    const CHANNEL_DEPTH: usize = 64;

    #[derive(Debug, Clone)]
    pub struct UreqTransport {
        pub chunk_size: usize,
    }

    impl Default for UreqTransport {
        fn default() -> Self {
            Self { chunk_size: CHUNK_SIZE }
        }
    }

    #[async_trait]
    impl ChatTransport for UreqTransport {
        async fn open(
            &self,
            url: &str,
            api_key: &str,
            body: &ChatCompletionRequest,
        ) -> Result<BoxedSource, RequestError> {
            let (open_tx, open_rx) = flume::bounded::<Result<(), RequestError>>(1);
            let (chunk_tx, chunk_rx) = flume::bounded(CHANNEL_DEPTH);

            let url = url.to_string();
            let auth = format!("Bearer {api_key}");
            let body = body.clone();
            let chunk_size = self.chunk_size.max(1);

            info!(target: "bevy_dive_buddy", "opening stream: url={} model={}", url, body.model);

            std::thread::Builder::new()
                .name("dive-buddy-http".into())
                .spawn(move || {
                    let config = ureq::Agent::config_builder().http_status_as_error(false).build();
                    let agent = ureq::Agent::new_with_config(config);
                    let res = match agent
                        .post(&url)
                        .header("authorization", &auth)
                        .header("accept", "text/event-stream")
                        .send_json(&body)
                    {
                        Ok(res) => res,
                        Err(err) => {
                            let _ = open_tx.send(Err(RequestError::network(err)));
                            return;
                        }
                    };

                    let status = res.status().as_u16();
                    if !(200..300).contains(&status) {
                        let text = res.into_body().read_to_string().unwrap_or_else(|err| {
                            warn!(target: "bevy_dive_buddy", "could not read error body (http {}): {}", status, err);
                            String::new()
                        });
                        let _ = open_tx.send(Err(RequestError::from_response(status, &text)));
                        return;
                    }
                    if open_tx.send(Ok(())).is_err() {
                        return;
                    }

                    let mut reader = res.into_body().into_reader();
                    let mut buf = vec![0u8; chunk_size];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                if chunk_tx.send(Ok(buf[..n].to_vec())).is_err() {
                                    debug!(target: "bevy_dive_buddy", "stream consumer went away; closing connection");
                                    break;
                                }
                            }
                            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
                            Err(err) => {
                                warn!(target: "bevy_dive_buddy", "body read failed: {}", err);
                                let _ = chunk_tx.send(Err(RequestError::network(err)));
                                break;
                            }
                        }
                    }
                })
                .map_err(RequestError::network)?;

            match open_rx.recv_async().await {
                Ok(Ok(())) => Ok(Box::new(ChannelSource::new(chunk_rx))),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(RequestError::network("http worker exited before responding")),
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use web::FetchTransport;

#[cfg(target_arch = "wasm32")]
mod web {
    use bevy::log::info;
    use js_sys::{Reflect, Uint8Array};
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;
    use web_sys::ReadableStreamDefaultReader;

    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct FetchTransport;

    #[async_trait(?Send)]
    impl ChatTransport for FetchTransport {
        async fn open(
            &self,
            url: &str,
            api_key: &str,
            body: &ChatCompletionRequest,
        ) -> Result<BoxedSource, RequestError> {
            info!(target: "bevy_dive_buddy", "opening stream: url={} model={}", url, body.model);

            let resp = gloo_net::http::Request::post(url)
                .header("authorization", &format!("Bearer {api_key}"))
                .header("accept", "text/event-stream")
                .json(body)
                .map_err(RequestError::network)?
                .send()
                .await
                .map_err(RequestError::network)?;

            if !resp.ok() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(RequestError::from_response(status, &text));
            }

            let stream = resp
                .body()
                .ok_or_else(|| RequestError::network("response has no body"))?;
            let reader: ReadableStreamDefaultReader = stream.get_reader().unchecked_into();
            Ok(Box::new(ReaderSource { reader: Some(reader) }))
        }
    }

    /// owns the reader lock on a fetch body; cancelled on close or drop.
    struct ReaderSource {
        reader: Option<ReadableStreamDefaultReader>,
    }

    fn js_error(err: JsValue) -> RequestError {
        RequestError::network(format!("{err:?}"))
    }

    #[async_trait(?Send)]
    impl ChunkSource for ReaderSource {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RequestError> {
            let Some(reader) = self.reader.as_ref() else {
                return Ok(None);
            };
            let result = JsFuture::from(reader.read()).await.map_err(js_error)?;
            let done = Reflect::get(&result, &JsValue::from_str("done"))
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if done {
                return Ok(None);
            }
            let value = Reflect::get(&result, &JsValue::from_str("value")).map_err(js_error)?;
            Ok(Some(Uint8Array::new(&value).to_vec()))
        }

        async fn close(&mut self) {
            if let Some(reader) = self.reader.take() {
                let _ = JsFuture::from(reader.cancel()).await;
                reader.release_lock();
            }
        }
    }

    impl Drop for ReaderSource {
        fn drop(&mut self) {
            if let Some(reader) = self.reader.take() {
                let _ = reader.cancel();
                reader.release_lock();
            }
        }
    }
}
