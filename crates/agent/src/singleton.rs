use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type RunFn =
    Arc<dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct State {
    votes: i64,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Vote-counted lifecycle for a long-running producer.
///
/// `start` increments the vote count and launches the run function on the
/// 0-to-1 transition; `stop` decrements and, on 1-to-0, cancels the quit
/// token and waits for the task to return. The run function must return
/// promptly after observing the token.
pub struct SingletonLoop {
    run: RunFn,
    state: Mutex<State>,
}

impl SingletonLoop {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            run: Arc::new(move |token| Box::pin(run(token))),
            state: Mutex::new(State {
                votes: 0,
                task: None,
            }),
        }
    }

    /// Add a vote; launches the loop when the count goes 0 -> 1.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.votes += 1;
        if state.votes == 1 {
            debug!("Singleton loop starting");
            let token = CancellationToken::new();
            let handle = tokio::spawn((self.run)(token.clone()));
            state.task = Some((token, handle));
        }
    }

    /// Remove a vote; on 1 -> 0 signals quit and waits for termination.
    ///
    /// Panics if called more times than `start`.
    pub async fn stop(&self) {
        let task = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.votes -= 1;
            assert!(
                state.votes >= 0,
                "singleton loop stopped more times than started"
            );
            if state.votes == 0 { state.task.take() } else { None }
        };
        if let Some((token, handle)) = task {
            debug!("Singleton loop stopping");
            token.cancel();
            let _ = handle.await;
        }
    }

    pub fn votes(&self) -> i64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).votes
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .task
            .is_some()
    }
}
