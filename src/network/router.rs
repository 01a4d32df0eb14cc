//! Method router
//!
//! An `Invoker` that maps exact `"Service.Method"` names to typed async
//! handlers. Arguments are decoded and replies encoded with the codec of the
//! connection the request arrived on.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::server::{InvokeError, Invoker};
use crate::protocol::{split_service_method, Payload};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Handler = Box<dyn Fn(Payload) -> BoxFuture<Result<Payload, InvokeError>> + Send + Sync>;

/// Name-based method table
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `service_method`, replacing any previous one.
    ///
    /// A handler error is sent back to the caller as the response error text.
    pub fn register<A, R, F, Fut>(&mut self, service_method: &str, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let method = service_method.to_string();
        let entry: Handler = Box::new(move |args: Payload| -> BoxFuture<Result<Payload, InvokeError>> {
            let codec_type = args.codec_type();
            let method = method.clone();
            let call = args.decode::<A>().map(&handler);
            Box::pin(async move {
                let call = call.map_err(|e| InvokeError::BadArgs {
                    method: method.clone(),
                    reason: e.to_string(),
                })?;
                let reply = call.await.map_err(InvokeError::Handler)?;
                Payload::encode(codec_type, &reply).map_err(|e| InvokeError::BadReply {
                    method,
                    reason: e.to_string(),
                })
            })
        });

        if self.methods.insert(service_method.to_string(), entry).is_some() {
            tracing::warn!("rpc router: replaced handler for {}", service_method);
        }
        self
    }

    /// Registered method names
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[async_trait]
impl Invoker for Router {
    async fn invoke(&self, service_method: &str, args: Payload) -> Result<Payload, InvokeError> {
        if split_service_method(service_method).is_none() {
            return Err(InvokeError::MalformedName(service_method.to_string()));
        }
        let handler = self
            .methods
            .get(service_method)
            .ok_or_else(|| InvokeError::UnknownMethod(service_method.to_string()))?;
        handler(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodecType;

    fn router() -> Router {
        let mut router = Router::new();
        router
            .register("Foo.Sum", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) })
            .register("Foo.Fail", |_: String| async move {
                Err::<(), _>("division by zero".to_string())
            });
        router
    }

    #[tokio::test]
    async fn test_invoke_registered_method() {
        let args = Payload::encode(CodecType::Bincode, &(2i64, 3i64)).unwrap();
        let reply = router().invoke("Foo.Sum", args).await.unwrap();
        assert_eq!(reply.decode::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reply_uses_request_codec() {
        let args = Payload::encode(CodecType::Json, &(1i64, 1i64)).unwrap();
        let reply = router().invoke("Foo.Sum", args).await.unwrap();
        assert_eq!(reply.codec_type(), CodecType::Json);
        assert_eq!(reply.bytes().as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_lookup_failures() {
        let router = router();
        let args = Payload::encode(CodecType::Bincode, "x").unwrap();

        let err = router.invoke("FooSum", args.clone()).await.unwrap_err();
        assert_eq!(err, InvokeError::MalformedName("FooSum".to_string()));

        let err = router.invoke("Foo.Product", args).await.unwrap_err();
        assert_eq!(err, InvokeError::UnknownMethod("Foo.Product".to_string()));
    }

    #[tokio::test]
    async fn test_bad_args_and_handler_errors() {
        let router = router();

        let args = Payload::encode(CodecType::Json, "not a pair").unwrap();
        let err = router.invoke("Foo.Sum", args).await.unwrap_err();
        assert!(matches!(err, InvokeError::BadArgs { ref method, .. } if method == "Foo.Sum"));

        let args = Payload::encode(CodecType::Bincode, "x").unwrap();
        let err = router.invoke("Foo.Fail", args).await.unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_methods_listed() {
        let router = router();
        let mut names: Vec<_> = router.methods().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Foo.Fail", "Foo.Sum"]);
    }
}
