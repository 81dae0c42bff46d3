//! Handler registry: binds job kinds to the code that executes them

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{HandlerError, QueueError};
use crate::job::JobId;

/// Kind-specific job data
pub trait JobPayload: Serialize + DeserializeOwned + Send + 'static {
    /// Shape checks beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl JobPayload for Value {}

/// A payload type bound to one kind, so it can be enqueued without naming the kind
pub trait TypedPayload: JobPayload {
    const KIND: &'static str;
}

/// What a handler knows about the attempt it is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub id: JobId,
    pub kind: String,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Executes jobs of one kind
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: JobPayload;

    async fn handle(&self, payload: Self::Payload, ctx: JobContext) -> Result<(), HandlerError>;
}

type RunFn = dyn Fn(Value, JobContext) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;
type ValidateFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

/// A resolved, type-erased handler
#[derive(Clone)]
pub struct RegisteredHandler {
    run: Arc<RunFn>,
    validate: Arc<ValidateFn>,
}

impl RegisteredHandler {
    /// Decode the payload and run the handler.
    ///
    /// A payload that no longer decodes is a terminal failure: retrying
    /// cannot fix it.
    pub fn invoke(&self, payload: Value, ctx: JobContext) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.run)(payload, ctx)
    }

    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        (self.validate)(payload)
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegisteredHandler(<function>)")
    }
}

fn decode<P: JobPayload>(payload: &Value) -> Result<P, String> {
    let decoded = P::deserialize(payload).map_err(|e| format!("invalid payload: {e}"))?;
    decoded.validate()?;
    Ok(decoded)
}

fn validator<P: JobPayload>() -> Arc<ValidateFn> {
    Arc::new(|payload: &Value| decode::<P>(payload).map(|_| ()))
}

/// Kind -> handler map shared by producers (validation) and the dispatcher
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind, replacing any previous one
    pub fn register<H: JobHandler>(&self, kind: impl Into<String>, handler: H) {
        let handler = Arc::new(handler);
        let run = move |payload: Value, ctx: JobContext| {
            let handler = handler.clone();
            async move {
                let payload =
                    decode::<H::Payload>(&payload).map_err(HandlerError::Terminal)?;
                handler.handle(payload, ctx).await
            }
            .boxed()
        };

        self.insert(
            kind.into(),
            RegisteredHandler {
                run: Arc::new(run),
                validate: validator::<H::Payload>(),
            },
        );
    }

    /// Register a closure as the handler for a kind
    pub fn register_fn<P, F, Fut>(&self, kind: impl Into<String>, f: F)
    where
        P: JobPayload,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let run = move |payload: Value, ctx: JobContext| {
            let f = f.clone();
            async move {
                let payload = decode::<P>(&payload).map_err(HandlerError::Terminal)?;
                (*f)(payload, ctx).await
            }
            .boxed()
        };

        self.insert(
            kind.into(),
            RegisteredHandler {
                run: Arc::new(run),
                validate: validator::<P>(),
            },
        );
    }

    fn insert(&self, kind: String, handler: RegisteredHandler) {
        tracing::debug!(job.kind = %kind, "Registered job handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn resolve(&self, kind: &str) -> Option<RegisteredHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    /// Check a submission before anything is persisted
    pub fn validate(&self, kind: &str, payload: &Value) -> Result<(), QueueError> {
        let handler = self
            .resolve(kind)
            .ok_or_else(|| QueueError::Validation(format!("unregistered job kind `{kind}`")))?;
        handler
            .validate(payload)
            .map_err(|e| QueueError::Validation(format!("{kind}: {e}")))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Transcode {
        video_id: u64,
        resolution: u32,
    }

    impl JobPayload for Transcode {
        fn validate(&self) -> Result<(), String> {
            if self.resolution == 0 {
                return Err("resolution must be positive".into());
            }
            Ok(())
        }
    }

    struct TranscodeHandler;

    #[async_trait]
    impl JobHandler for TranscodeHandler {
        type Payload = Transcode;

        async fn handle(&self, payload: Transcode, _ctx: JobContext) -> Result<(), HandlerError> {
            if payload.video_id == 0 {
                return Err(HandlerError::terminal("no such video"));
            }
            Ok(())
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            id: 1,
            kind: "video-transcode".into(),
            attempt: 1,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_validate_unregistered_kind() {
        let registry = HandlerRegistry::new();
        let err = registry.validate("unknown-kind", &json!({})).unwrap_err();
        assert!(matches!(err, QueueError::Validation(msg) if msg.contains("unknown-kind")));
    }

    #[test]
    fn test_validate_payload_shape() {
        let registry = HandlerRegistry::new();
        registry.register("video-transcode", TranscodeHandler);

        assert!(registry
            .validate("video-transcode", &json!({"video_id": 7, "resolution": 720}))
            .is_ok());
        assert!(registry
            .validate("video-transcode", &json!({"video_id": "seven"}))
            .is_err());
        assert!(registry
            .validate("video-transcode", &json!({"video_id": 7, "resolution": 0}))
            .is_err());
    }

    #[tokio::test]
    async fn test_invoke_typed_handler() {
        let registry = HandlerRegistry::new();
        registry.register("video-transcode", TranscodeHandler);
        let handler = registry.resolve("video-transcode").unwrap();

        let ok = handler
            .invoke(json!({"video_id": 7, "resolution": 720}), ctx())
            .await;
        assert!(ok.is_ok());

        let missing = handler
            .invoke(json!({"video_id": 0, "resolution": 720}), ctx())
            .await;
        assert_eq!(missing, Err(HandlerError::Terminal("no such video".into())));

        let garbage = handler.invoke(json!("garbage"), ctx()).await;
        assert!(matches!(garbage, Err(HandlerError::Terminal(_))));
    }

    #[tokio::test]
    async fn test_register_fn_and_kinds() {
        let registry = HandlerRegistry::new();
        registry.register_fn("b", |_: Value, _ctx| async { Ok::<(), HandlerError>(()) });
        registry.register_fn("a", |_: Value, ctx: JobContext| async move {
            Err::<(), _>(HandlerError::transient(format!("attempt {}", ctx.attempt)))
        });

        assert_eq!(registry.kinds(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.is_registered("a"));
        assert!(!registry.is_registered("c"));

        let result = registry.resolve("a").unwrap().invoke(json!({}), ctx()).await;
        assert_eq!(result, Err(HandlerError::Transient("attempt 1".into())));
    }
}
