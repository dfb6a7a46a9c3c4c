//! The per-route dispatch pipeline.
//!
//! Every registered route is wrapped into a [`DispatchFn`] that runs, in order:
//!
//! 1. `before_request` hooks, outermost middleware first;
//! 2. argument binding and dependency resolution;
//! 3. the handler, on its own task so a panic becomes an unexpected error;
//! 4. scoped dependency teardowns, last acquired first;
//! 5. error translation (exception handlers, then `on_error` hooks, then the
//!    default rendering), or the status override for error-status responses;
//! 6. `after_request` hooks, innermost first;
//! 7. hand-off of queued background tasks to a fresh task.
//!
//! The middleware stack, exception handlers, dependency overrides, and state are
//! read from snapshots on every request, so changes made after a route was
//! registered still apply to it.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::{
    BoxFuture,
    background::BackgroundTasks,
    context::{Context, State},
    dependency::{DependencyOverrides, ResolutionCache, Resolver, TeardownScope},
    error::{Error, HttpError},
    exception::{self, ExceptionHandlers},
    http::{Request, Response},
    middleware::{BeforeError, ErrorHandlerMiddleware, HookError, MiddlewareChain},
    router::Endpoint,
};

/// The callable handed to the transport engine for one route.
pub type DispatchFn = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Application-wide tables every dispatch reads.
pub(crate) struct Core {
    pub(crate) middleware: ArcSwap<MiddlewareChain>,
    pub(crate) exception_handlers: ArcSwap<ExceptionHandlers>,
    pub(crate) overrides: ArcSwap<DependencyOverrides>,
    pub(crate) state: ArcSwap<State>,
}

impl Core {
    pub(crate) fn new(debug: bool) -> Self {
        let mut middleware = MiddlewareChain::new();
        middleware.push(Arc::new(ErrorHandlerMiddleware::new(debug)));
        Self {
            middleware: ArcSwap::from_pointee(middleware),
            exception_handlers: ArcSwap::from_pointee(ExceptionHandlers::new()),
            overrides: ArcSwap::from_pointee(DependencyOverrides::new()),
            state: ArcSwap::from_pointee(State::new()),
        }
    }
}

/// Builds the dispatch callable for `endpoint`.
pub(crate) fn wrap(core: Arc<Core>, endpoint: Arc<Endpoint>) -> DispatchFn {
    Arc::new(move |request| {
        let core = Arc::clone(&core);
        let endpoint = Arc::clone(&endpoint);
        Box::pin(async move { dispatch(&core, Some(&endpoint), request).await })
    })
}

/// Runs one request through the pipeline. `None` is the not-found fallback.
pub(crate) async fn dispatch(
    core: &Core,
    endpoint: Option<&Arc<Endpoint>>,
    mut request: Request,
) -> Response {
    let chain = core.middleware.load_full();
    let handlers = core.exception_handlers.load_full();
    let background = BackgroundTasks::new();

    let (request, outcome, depth) = match chain.run_before(&mut request) {
        Ok(()) => {
            let request = Arc::new(request);
            let outcome = run_endpoint(core, &chain, &handlers, endpoint, &request, &background).await;
            (request, outcome, chain.len())
        }
        Err(BeforeError::Rejected { completed, error }) => {
            debug!(status = error.status().as_u16(), "request rejected by middleware");
            let response = handlers.translate(&request, &error);
            (Arc::new(request), Ok(response), completed)
        }
        Err(BeforeError::Fatal(_)) => return exception::internal_error(),
    };

    let response = match outcome {
        Ok(mut response) => match chain.run_after(&request, &mut response, depth) {
            Ok(()) => response,
            Err(_) => exception::internal_error(),
        },
        Err(_) => exception::internal_error(),
    };

    if let Some(_handle) = background.spawn() {
        debug!(path = request.path(), "background tasks scheduled");
    }
    response
}

async fn run_endpoint(
    core: &Core,
    chain: &MiddlewareChain,
    handlers: &ExceptionHandlers,
    endpoint: Option<&Arc<Endpoint>>,
    request: &Arc<Request>,
    background: &BackgroundTasks,
) -> Result<Response, HookError> {
    let Some(endpoint) = endpoint else {
        let error: Error = HttpError::not_found(exception::NO_ROUTE).into();
        return handle_error(chain, handlers, request, &error, |_| exception::not_found());
    };

    match invoke(core, endpoint, request, background).await {
        Ok(response) => Ok(override_error_status(handlers, request, response)),
        Err(error) => handle_error(chain, handlers, request, &error, exception::default_response),
    }
}

async fn invoke(
    core: &Core,
    endpoint: &Arc<Endpoint>,
    request: &Arc<Request>,
    background: &BackgroundTasks,
) -> Result<Response, Error> {
    let arguments = endpoint.bind(request)?;

    let endpoint = Arc::clone(endpoint);
    let request = Arc::clone(request);
    let background = background.clone();
    let overrides = core.overrides.load_full();
    let state = core.state.load_full();

    // Resolution, the handler and teardown share one task: dropping the caller's
    // future detaches it instead of skipping the teardowns.
    let scoped = tokio::spawn(async move {
        let mut cache = ResolutionCache::new();
        let mut scope = TeardownScope::new();
        let resolved = Resolver::new(&request, &overrides, &mut cache, &mut scope)
            .resolve(endpoint.dependencies())
            .await;

        let outcome = match resolved {
            Ok(dependencies) => {
                let ctx = Context::new(Arc::clone(&request), arguments, dependencies, background, state);
                // Synchronous handlers run inside the call, so the call itself goes on a task.
                let handler = endpoint.handler();
                match tokio::spawn(async move { handler(ctx).await }).await {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(join_error.into()),
                }
            }
            Err(error) => Err(error),
        };

        scope.close().await;
        outcome
    });

    match scoped.await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(join_error.into()),
    }
}

// Raised errors: exception handlers, then on_error hooks, then `fallback`.
fn handle_error(
    chain: &MiddlewareChain,
    handlers: &ExceptionHandlers,
    request: &Request,
    error: &Error,
    fallback: fn(&Error) -> Response,
) -> Result<Response, HookError> {
    if let Some(handler) = handlers.find(error) {
        return Ok(handler(request, error));
    }
    if let Some(response) = chain.run_on_error(request, error)? {
        return Ok(response);
    }
    Ok(fallback(error))
}

// A returned response with an error status still goes through status handlers.
fn override_error_status(handlers: &ExceptionHandlers, request: &Request, response: Response) -> Response {
    let status = response.status();
    if !status.is_error() {
        return response;
    }
    match handlers.for_status(status) {
        Some(handler) => {
            let error: Error = HttpError::from_status(status).into();
            handler(request, &error)
        }
        None => response,
    }
}
