//! Filter Chain (spec §4.7): ordered, pluggable request/response
//! interceptors wrapped around the Invoker core.

use std::sync::Arc;

use async_trait::async_trait;

use crate::request::{Request, Response};

/// One interceptor. `before_send` runs in chain order before the call
/// leaves the Refer (or before the Exporter dispatches to the business
/// executor); returning `Some(Response)` short-circuits the chain and
/// skips every filter after it, plus the call itself. `after_receive` runs
/// in reverse chain order over the Response, letting filters installed
/// early wrap filters installed late (spec §4.7's "onion" ordering).
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Lower sorts first, ties break on name (spec §4.7, same convention
    /// as [`crate::plugin::PluginRegistry`]).
    fn priority(&self) -> i32 {
        0
    }

    async fn before_send(&self, request: &mut Request) -> Option<Response> {
        let _ = request;
        None
    }

    async fn after_receive(&self, request: &Request, response: Response) -> Response {
        let _ = request;
        response
    }
}

/// Immutable once built: an Invoker constructs one `FilterChain` at open
/// time and reuses it for every call over its lifetime (spec §4.7).
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new(mut filters: Vec<Arc<dyn Filter>>) -> Self {
        filters.sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.name().cmp(b.name())));
        Self { filters }
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run `before_send` in chain order, short-circuiting on the first
    /// filter that returns a Response, then run the operation, then run
    /// `after_receive` in reverse order over whichever Response resulted.
    pub async fn run<F, Fut>(&self, mut request: Request, operation: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: std::future::Future<Output = Response>,
    {
        let mut short_circuited = None;
        for filter in &self.filters {
            if let Some(response) = filter.before_send(&mut request).await {
                short_circuited = Some(response);
                break;
            }
        }

        let mut response = match short_circuited {
            Some(r) => r,
            None => operation(request.clone()).await,
        };

        for filter in self.filters.iter().rev() {
            response = filter.after_receive(&request, response).await;
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingFilter {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Filter for RecordingFilter {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn before_send(&self, _request: &mut Request) -> Option<Response> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            None
        }

        async fn after_receive(&self, _request: &Request, response: Response) -> Response {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
            response
        }
    }

    struct ShortCircuitFilter;

    #[async_trait]
    impl Filter for ShortCircuitFilter {
        fn name(&self) -> &str {
            "short-circuit"
        }

        fn priority(&self) -> i32 {
            -10
        }

        async fn before_send(&self, request: &mut Request) -> Option<Response> {
            Some(Response::remote_error(request.id, "blocked", false))
        }
    }

    #[tokio::test]
    async fn filters_run_before_in_order_and_after_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            Arc::new(RecordingFilter { name: "b", priority: 2, log: Arc::clone(&log) }),
            Arc::new(RecordingFilter { name: "a", priority: 1, log: Arc::clone(&log) }),
        ]);

        let request = Request::new("Echo", "echo", vec![]);
        let response = chain.run(request, |req| async move { Response::ok(req.id, serde_json::json!(null)) }).await;

        assert!(matches!(response.outcome, crate::request::Outcome::Ok(_)));
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "before:b", "after:b", "after:a"]);
    }

    #[tokio::test]
    async fn an_earlier_filter_short_circuits_everything_after_it() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            Arc::new(ShortCircuitFilter),
            Arc::new(RecordingFilter { name: "never-runs", priority: 5, log: Arc::clone(&log) }),
        ]);

        let request = Request::new("Echo", "echo", vec![]);
        let response = chain.run(request, |req| async move { Response::ok(req.id, serde_json::json!("should not happen")) }).await;

        match response.outcome {
            crate::request::Outcome::RemoteError { message, .. } => assert_eq!(message, "blocked"),
            other => panic!("expected short-circuit, got {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
    }
}
