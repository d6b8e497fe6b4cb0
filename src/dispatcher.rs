//! Request dispatcher.
//!
//! Every inbound frame from the receive loop lands here. Request bodies are
//! scanned into calls, gated on the trust state, run, and answered with one
//! reply body per frame using the request's own header and context.
//!
//! Before registration completes only a single handshake call per frame is
//! accepted. Batches, empty bodies and other names are dropped with a
//! warning and the socket stays open.
//!
//! Once trusted, each frame runs as its own task under a concurrency cap;
//! the calls of a batch run concurrently within that task. A frame over the
//! cap gets a busy error for each of its calls. Handshake calls
//! always run inline on the receive loop so trust changes are visible to the
//! next frame.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::codec::{reply, scan, Call};
use crate::handler::{relay_log, system_names, Context, HandlerRegistry, SystemCall};
use crate::handshake::{unix_now, Handshake, Verdict};
use crate::protocol::{Frame, InboundFrame, ResultFrame};
use crate::state::{ConnectionState, Link};

/// Default cap on concurrently running request frames.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Error returned for each call of a frame that found no free handler slot.
pub const BUSY_MESSAGE: &str = "Service busy, try again later";

/// Receives result frames for calls this side initiated.
///
/// Only invoked while the connection is trusted. Correlation by request id
/// is left to the implementation.
pub trait ResultSink: Send + Sync + 'static {
    /// Handle one result frame.
    fn on_result(&self, frame: ResultFrame);
}

/// Routes inbound frames to the handshake, the system calls and the handler
/// registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    handshake: Arc<Handshake>,
    state: Arc<ConnectionState>,
    semaphore: Arc<Semaphore>,
    result_sink: Option<Arc<dyn ResultSink>>,
}

type Outcome = std::result::Result<Value, String>;

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        handshake: Arc<Handshake>,
        state: Arc<ConnectionState>,
        max_concurrent_handlers: usize,
        result_sink: Option<Arc<dyn ResultSink>>,
    ) -> Self {
        Self {
            registry,
            handshake,
            state,
            semaphore: Arc::new(Semaphore::new(max_concurrent_handlers)),
            result_sink,
        }
    }

    /// Every name the directory may call: system calls first, then the
    /// registry in registration order.
    pub fn function_names(&self) -> Vec<String> {
        system_names().chain(self.registry.names().iter().cloned()).collect()
    }

    /// Handle one inbound frame.
    pub async fn dispatch(&self, frame: InboundFrame, link: &Link) {
        match frame {
            InboundFrame::Request(frame) => self.dispatch_request(frame, link).await,
            InboundFrame::Result(result) => self.dispatch_result(result),
            InboundFrame::Unsupported { flag, version } => {
                tracing::warn!(flag, version, "Dropping frame with unsupported protocol version");
            }
            InboundFrame::Malformed { flag, reason } => {
                tracing::warn!(flag, "Dropping frame with malformed header: {}", reason);
            }
        }
    }

    fn dispatch_result(&self, result: ResultFrame) {
        match &self.result_sink {
            Some(sink) if self.state.is_trusted() => sink.on_result(result),
            _ => tracing::debug!(request_id = ?result.request_id(), "Dropping unexpected result frame"),
        }
    }

    async fn dispatch_request(&self, frame: Frame, link: &Link) {
        let ctx = Context::from_frame(&frame);
        let calls = match scan(&frame.body) {
            Ok(calls) => calls,
            Err(e) => {
                tracing::warn!(request_id = ctx.request_id(), "Dropping malformed call body: {}", e);
                return;
            }
        };

        if !self.state.is_trusted() {
            self.dispatch_untrusted(calls, ctx, link).await;
            return;
        }

        if calls.is_empty() {
            let body = reply::function_list(&self.function_names());
            if let Err(e) = link.send(ctx.response_frames(&body)).await {
                tracing::debug!(request_id = ctx.request_id(), "Function list not sent: {}", e);
            }
            return;
        }

        if calls.len() == 1 && is_handshake(&calls[0]) {
            self.answer(&calls, &ctx, link).await;
            return;
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    request_id = ctx.request_id(),
                    "Handler capacity reached, refusing {} call(s)",
                    calls.len()
                );
                let busy: Vec<Outcome> = calls.iter().map(|_| Err(BUSY_MESSAGE.to_string())).collect();
                if let Err(e) = link.send(ctx.response_frames(&reply::results(&busy))).await {
                    tracing::debug!(request_id = ctx.request_id(), "Busy reply not sent: {}", e);
                }
                return;
            }
        };

        let this = self.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let _permit = permit;
            this.answer(&calls, &ctx, &link).await;
        });
    }

    async fn dispatch_untrusted(&self, calls: Vec<Call>, ctx: Context, link: &Link) {
        match calls.as_slice() {
            [] => {
                tracing::warn!(request_id = ctx.request_id(), "Dropping empty call body before registration");
            }
            [call] if is_handshake(call) => self.answer(&calls, &ctx, link).await,
            [call] => {
                tracing::warn!(
                    request_id = ctx.request_id(),
                    call = %call.name,
                    "Dropping call before registration"
                );
            }
            _ => {
                tracing::warn!(
                    request_id = ctx.request_id(),
                    "Rejecting batch of {} calls before registration",
                    calls.len()
                );
            }
        }
    }

    /// Run `calls`, send the combined reply, then apply the strictest verdict.
    async fn answer(&self, calls: &[Call], ctx: &Context, link: &Link) {
        let results = join_all(calls.iter().map(|call| self.invoke(call, ctx))).await;

        let mut verdict = Verdict::Continue;
        let mut outcomes = Vec::with_capacity(results.len());
        for (call, (outcome, call_verdict)) in calls.iter().zip(results) {
            if let Err(message) = &outcome {
                tracing::warn!(
                    request_id = ctx.request_id(),
                    call = %call.name,
                    "Call failed: {}",
                    message
                );
            }
            if call_verdict == Verdict::Fatal {
                verdict = Verdict::Fatal;
            }
            outcomes.push(outcome);
        }

        let frames = ctx.response_frames(&reply::results(&outcomes));
        match verdict {
            Verdict::Continue => {
                if let Err(e) = link.send(frames).await {
                    tracing::debug!(request_id = ctx.request_id(), "Response not sent: {}", e);
                }
            }
            Verdict::Fatal => {
                if let Err(e) = link.send_and_flush(frames).await {
                    tracing::debug!(request_id = ctx.request_id(), "Final response not sent: {}", e);
                }
                self.state.set_fatal();
                tracing::error!("Reconnection disabled, restart the service after fixing the configuration");
                link.close();
            }
        }
    }

    async fn invoke(&self, call: &Call, ctx: &Context) -> (Outcome, Verdict) {
        let args = match call.arguments() {
            Ok(args) => args,
            Err(e) => return (Err(e.to_string()), Verdict::Continue),
        };

        let Some(system) = SystemCall::from_name(&call.name) else {
            return (self.invoke_handler(&call.name, args, ctx.clone()).await, Verdict::Continue);
        };

        match system {
            SystemCall::Challenge => {
                let reply = self.handshake.challenge(&args, unix_now()).await;
                (Ok(reply.value), reply.verdict)
            }
            SystemCall::Confirm => {
                let reply = self.handshake.confirm(&args);
                (Ok(reply.value), reply.verdict)
            }
            SystemCall::Reject => {
                let reply = self.handshake.reject(&args);
                (Ok(reply.value), reply.verdict)
            }
            SystemCall::Ping => (Ok(Value::Bool(true)), Verdict::Continue),
            SystemCall::GetFunctions => (Ok(Value::from(self.function_names())), Verdict::Continue),
            SystemCall::Log => {
                relay_log(&args);
                (Ok(Value::Null), Verdict::Continue)
            }
            SystemCall::Close => {
                let message = args.first().and_then(Value::as_str).unwrap_or("");
                tracing::warn!("Connection closed by the directory: {}", message);
                (Ok(Value::Null), Verdict::Fatal)
            }
        }
    }

    async fn invoke_handler(&self, name: &str, args: Vec<Value>, ctx: Context) -> Outcome {
        let request_id = ctx.request_id();
        match AssertUnwindSafe(self.registry.dispatch(name, args, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                tracing::error!(request_id, call = %name, "Handler panicked");
                Err(format!("{}() panicked", name))
            }
        }
    }
}

fn is_handshake(call: &Call) -> bool {
    SystemCall::from_name(&call.name).is_some_and(SystemCall::is_handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_batch;
    use crate::error::ServiceError;
    use crate::handshake::{challenge_hash, Credentials, IpLookup};
    use crate::protocol::{FrameBuffer, Header, HEADER_SIZE};
    use crate::writer::spawn_writer_task;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Peer {
        socket: DuplexStream,
        frames: FrameBuffer,
        queued: Vec<InboundFrame>,
    }

    impl Peer {
        /// Body of the next response, or `None` if nothing arrives in time.
        async fn next_body(&mut self) -> Option<Vec<u8>> {
            loop {
                if !self.queued.is_empty() {
                    return match self.queued.remove(0) {
                        InboundFrame::Result(result) => Some(result.payload[HEADER_SIZE..].to_vec()),
                        other => panic!("unexpected {:?}", other),
                    };
                }
                let mut buf = vec![0u8; 4096];
                let read = tokio::time::timeout(Duration::from_millis(200), self.socket.read(&mut buf));
                let n = match read.await {
                    Ok(Ok(n)) if n > 0 => n,
                    _ => return None,
                };
                self.queued.extend(self.frames.push(&buf[..n]).unwrap());
            }
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.add_function("test_hello", |(name,): (String,), _ctx| async move {
            Ok(format!("hi: {}", name))
        });
        registry.add_function("test_fail", |_: (), _ctx| async {
            Err::<(), _>(ServiceError::handler("boom"))
        });
        registry.add_function("test_panic", |_: (), _ctx| async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        registry.add_function("test_slow", |_: (), _ctx| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok("slow")
        });
        registry
    }

    fn setup_with(max_handlers: usize, sink: Option<Arc<dyn ResultSink>>) -> (Dispatcher, Arc<ConnectionState>, Link, Peer) {
        let state = Arc::new(ConnectionState::new());
        let registry = Arc::new(registry());
        let credentials = Credentials {
            app: "demo".to_string(),
            service: "test".to_string(),
            key: "123456".to_string(),
            version: "1.0".to_string(),
        };
        let handshake = Arc::new(Handshake::new(
            credentials,
            state.clone(),
            registry.clone(),
            IpLookup::default(),
        ));
        let dispatcher = Dispatcher::new(registry, handshake, state.clone(), max_handlers, sink);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(client, &Default::default());
        let (link, _close_rx) = Link::new(writer);
        let peer = Peer {
            socket: server,
            frames: FrameBuffer::new(),
            queued: Vec::new(),
        };
        (dispatcher, state, link, peer)
    }

    fn setup() -> (Dispatcher, Arc<ConnectionState>, Link, Peer) {
        setup_with(DEFAULT_MAX_CONCURRENT_HANDLERS, None)
    }

    fn request(request_id: u32, body: Vec<u8>) -> InboundFrame {
        InboundFrame::Request(
            Frame::new(0, 1, Header::new(1, 2, request_id, 4, 0), Bytes::new(), Bytes::from(body)).unwrap(),
        )
    }

    fn challenge_call() -> Vec<u8> {
        let now = unix_now();
        let rand = "0123456789abcdef";
        let args = [json!(now), json!(rand), json!(challenge_hash(&now.to_string(), rand))];
        encode_batch(&[("sys_reg", &args)])
    }

    #[tokio::test]
    async fn test_untrusted_single_challenge_is_processed() {
        let (dispatcher, state, link, mut peer) = setup();
        dispatcher.dispatch(request(1, challenge_call()), &link).await;

        let body = peer.next_body().await.expect("challenge reply");
        let value = crate::codec::HproseCodec::decode(&body[1..]).unwrap();
        assert_eq!(value["status"], json!(true));
        assert_eq!(state.phase(), crate::state::Phase::Registering);
    }

    #[tokio::test]
    async fn test_untrusted_batch_is_dropped() {
        let (dispatcher, _state, link, mut peer) = setup();
        let now = unix_now();
        let rand = "0123456789abcdef";
        let args = [json!(now), json!(rand), json!(challenge_hash(&now.to_string(), rand))];
        let body = encode_batch(&[("sys_reg", &args), ("sys_reg", &args)]);

        dispatcher.dispatch(request(1, body), &link).await;
        assert!(peer.next_body().await.is_none());
    }

    #[tokio::test]
    async fn test_untrusted_user_call_is_dropped() {
        let (dispatcher, state, link, mut peer) = setup();
        dispatcher
            .dispatch(request(1, encode_batch(&[("test_hello", &[json!("x")])])), &link)
            .await;
        dispatcher.dispatch(request(2, encode_batch(&[("sys_ping", &[])])), &link).await;
        dispatcher.dispatch(request(3, b"z".to_vec()), &link).await;

        assert!(peer.next_body().await.is_none());
        assert!(!link.is_closing());
        assert!(!state.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_body_is_dropped() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));
        dispatcher.dispatch(request(1, b"Xgarbage".to_vec()), &link).await;

        assert!(peer.next_body().await.is_none());
        assert!(!link.is_closing());
    }

    #[tokio::test]
    async fn test_trusted_call_and_errors() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));

        let body = encode_batch(&[("TEST_HELLO", &[json!("bob")]), ("test_fail", &[]), ("missing", &[])]);
        dispatcher.dispatch(request(7, body), &link).await;

        let reply_body = peer.next_body().await.expect("reply");
        let expected = reply::results(&[
            Ok(json!("hi: bob")),
            Err("boom".to_string()),
            Err("Can't find this function missing().".to_string()),
        ]);
        assert_eq!(reply_body, expected);
        assert!(state.is_trusted());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error_reply() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));

        dispatcher.dispatch(request(1, encode_batch(&[("test_panic", &[])])), &link).await;
        let body = peer.next_body().await.expect("reply");
        assert_eq!(body, reply::results(&[Err("test_panic() panicked".to_string())]));
        assert!(state.is_trusted());
    }

    #[tokio::test]
    async fn test_trusted_system_calls() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));

        dispatcher.dispatch(request(1, encode_batch(&[("sys_ping", &[])])), &link).await;
        assert_eq!(peer.next_body().await.unwrap(), reply::results(&[Ok(json!(true))]));

        dispatcher.dispatch(request(2, b"z".to_vec()), &link).await;
        assert_eq!(
            peer.next_body().await.unwrap(),
            reply::function_list(&dispatcher.function_names())
        );

        dispatcher
            .dispatch(request(3, encode_batch(&[("sys_log", &[json!("warn"), json!("hello")])])), &link)
            .await;
        assert_eq!(peer.next_body().await.unwrap(), reply::results(&[Ok(Value::Null)]));
    }

    #[tokio::test]
    async fn test_function_names_include_system_calls() {
        let (dispatcher, _state, _link, _peer) = setup();
        let names = dispatcher.function_names();
        assert_eq!(names[0], "sys_reg");
        assert!(names.contains(&"sys_ping".to_string()));
        assert!(names.contains(&"test_hello".to_string()));
    }

    #[tokio::test]
    async fn test_sys_close_is_fatal() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));

        dispatcher
            .dispatch(request(1, encode_batch(&[("sys_close", &[json!("bye")])])), &link)
            .await;
        assert_eq!(peer.next_body().await.unwrap(), reply::results(&[Ok(Value::Null)]));
        assert!(state.is_fatal());
        assert!(link.is_closing());
    }

    #[tokio::test]
    async fn test_reject_replies_then_closes() {
        let (dispatcher, state, link, mut peer) = setup();
        dispatcher
            .dispatch(request(1, encode_batch(&[("sys_regErr", &[json!("bad key")])])), &link)
            .await;

        assert!(state.is_fatal());
        assert!(link.is_closing());
        assert_eq!(peer.next_body().await.unwrap(), reply::results(&[Ok(Value::Null)]));
    }

    #[tokio::test]
    async fn test_capacity_limit_answers_busy() {
        let (dispatcher, state, link, mut peer) = setup_with(1, None);
        state.trust(json!(null));

        dispatcher.dispatch(request(1, encode_batch(&[("test_slow", &[])])), &link).await;
        dispatcher
            .dispatch(request(2, encode_batch(&[("sys_ping", &[]), ("test_hello", &[json!("x")])])), &link)
            .await;

        // The batch found no free slot and is refused call by call.
        let busy: Outcome = Err(BUSY_MESSAGE.to_string());
        assert_eq!(peer.next_body().await.unwrap(), reply::results(&[busy.clone(), busy]));

        let slow = tokio::time::timeout(Duration::from_secs(2), peer.next_body_patient()).await.unwrap();
        assert_eq!(slow.unwrap(), reply::results(&[Ok(json!("slow"))]));
        assert!(peer.next_body().await.is_none());
    }

    impl Peer {
        async fn next_body_patient(&mut self) -> Option<Vec<u8>> {
            for _ in 0..10 {
                if let Some(body) = self.next_body().await {
                    return Some(body);
                }
            }
            None
        }
    }

    struct Collect(Mutex<Vec<Option<u32>>>);

    impl ResultSink for Collect {
        fn on_result(&self, frame: ResultFrame) {
            self.0.lock().push(frame.request_id());
        }
    }

    #[tokio::test]
    async fn test_result_frames_reach_sink_only_when_trusted() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let (dispatcher, state, link, _peer) = setup_with(4, Some(sink.clone()));

        let mut payload = Header::new(1, 2, 99, 4, 0).encode().to_vec();
        payload.extend_from_slice(b"Rtz");
        let result = ResultFrame {
            flag: crate::protocol::flags::RESULT_MODE,
            version: 1,
            payload: Bytes::from(payload),
        };

        dispatcher.dispatch(InboundFrame::Result(result.clone()), &link).await;
        assert!(sink.0.lock().is_empty());

        state.trust(json!(null));
        dispatcher.dispatch(InboundFrame::Result(result), &link).await;
        assert_eq!(*sink.0.lock(), vec![Some(99)]);
    }

    #[tokio::test]
    async fn test_malformed_header_is_ignored() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));
        let frame = InboundFrame::Malformed {
            flag: 0,
            reason: "context length 200 overruns frame length 19".to_string(),
        };
        dispatcher.dispatch(frame, &link).await;
        assert!(peer.next_body().await.is_none());
        assert!(!link.is_closing());
        assert!(state.is_trusted());
    }

    #[tokio::test]
    async fn test_unsupported_version_is_ignored() {
        let (dispatcher, state, link, mut peer) = setup();
        state.trust(json!(null));
        dispatcher
            .dispatch(InboundFrame::Unsupported { flag: 0, version: 2 }, &link)
            .await;
        assert!(peer.next_body().await.is_none());
        assert!(!link.is_closing());
    }
}
