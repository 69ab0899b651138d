//! Completion correlation by request id.
//!
//! Engines finish jobs on their own threads. A [`CompletionBoard`] is where
//! they post the status, and where the dispatcher blocks until its request
//! shows up or the timeout expires.

use super::job::RequestId;
use crate::error::DispatchError;
use crate::memory::defaults::COMPLETION_BOARD_DEPTH;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct BoardState {
    pending: HashSet<RequestId>,
    done: HashMap<RequestId, i32>,
    abandoned: HashSet<RequestId>,
}

/// Rendezvous between engines and a waiting dispatcher.
pub struct CompletionBoard {
    state: Mutex<BoardState>,
    cond: Condvar,
    depth: usize,
}

impl CompletionBoard {
    /// Create a board with the default depth.
    pub fn new() -> Arc<Self> {
        Self::with_depth(COMPLETION_BOARD_DEPTH)
    }

    /// Create a board that tracks at most `depth` outstanding requests.
    pub fn with_depth(depth: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BoardState::default()),
            cond: Condvar::new(),
            depth: depth.max(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `id` and return the handle its engine completes.
    pub fn register(self: &Arc<Self>, id: RequestId) -> Result<CompletionHandle, DispatchError> {
        let mut state = self.lock();
        if state.pending.len() + state.done.len() >= self.depth {
            return Err(DispatchError::QueueFull);
        }
        state.abandoned.remove(&id);
        state.done.remove(&id);
        state.pending.insert(id);
        Ok(CompletionHandle {
            board: Arc::clone(self),
            id,
            completed: false,
        })
    }

    /// Post the status of `id`.
    ///
    /// Completions of abandoned or unknown requests are discarded.
    pub fn complete(&self, id: RequestId, status: i32) {
        let mut state = self.lock();
        if state.abandoned.remove(&id) {
            tracing::debug!(request_id = %id, status, "discarding late completion");
            return;
        }
        if !state.pending.remove(&id) {
            tracing::debug!(request_id = %id, status, "completion for unknown request");
            return;
        }
        state.done.insert(id, status);
        drop(state);
        self.cond.notify_all();
    }

    /// Block until `id` completes, returning its status.
    ///
    /// On expiry the request is abandoned and `Timeout` is returned. A
    /// timeout too large to express as a deadline waits indefinitely.
    pub fn wait(&self, id: RequestId, timeout: Duration) -> Result<i32, DispatchError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if let Some(status) = state.done.remove(&id) {
                return Ok(status);
            }
            if !state.pending.contains(&id) {
                return Err(DispatchError::MessageLost);
            }
            let Some(deadline) = deadline else {
                state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                state.pending.remove(&id);
                state.abandoned.insert(id);
                return Err(DispatchError::Timeout);
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop tracking a request that was never submitted.
    pub fn cancel(&self, id: RequestId) {
        let mut state = self.lock();
        state.pending.remove(&id);
        state.done.remove(&id);
    }

    /// Requests registered and not yet completed.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Requests abandoned after a timeout whose completion has not arrived.
    pub fn abandoned(&self) -> usize {
        self.lock().abandoned.len()
    }
}

impl std::fmt::Debug for CompletionBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CompletionBoard")
            .field("pending", &state.pending.len())
            .field("done", &state.done.len())
            .field("abandoned", &state.abandoned.len())
            .finish()
    }
}

/// Completes one request on its board.
///
/// Dropping the handle without completing reports the message as lost.
pub struct CompletionHandle {
    board: Arc<CompletionBoard>,
    id: RequestId,
    completed: bool,
}

impl CompletionHandle {
    /// Request this handle completes.
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Post an errno-style status (0 for success).
    pub fn complete(mut self, status: i32) {
        self.completed = true;
        self.board.complete(self.id, status);
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if !self.completed {
            self.board.complete(self.id, DispatchError::MessageLost.errno());
        }
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("request_id", &self.id)
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_then_wait() {
        let board = CompletionBoard::new();
        let handle = board.register(RequestId(7)).unwrap();
        handle.complete(0);
        assert_eq!(board.wait(RequestId(7), Duration::from_millis(10)), Ok(0));
        assert_eq!(board.pending(), 0);
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let board = CompletionBoard::new();
        let handle = board.register(RequestId(1)).unwrap();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.complete(libc::ECANCELED);
        });

        let status = board.wait(RequestId(1), Duration::from_secs(5)).unwrap();
        assert_eq!(DispatchError::from_errno(status), DispatchError::OperatorException);
        worker.join().unwrap();
    }

    #[test]
    fn test_timeout_abandons_late_completion() {
        let board = CompletionBoard::new();
        let handle = board.register(RequestId(2)).unwrap();

        assert_eq!(
            board.wait(RequestId(2), Duration::from_millis(5)),
            Err(DispatchError::Timeout)
        );
        assert_eq!(board.abandoned(), 1);

        handle.complete(0);
        assert_eq!(board.abandoned(), 0);
        assert_eq!(
            board.wait(RequestId(2), Duration::from_millis(1)),
            Err(DispatchError::MessageLost)
        );
    }

    #[test]
    fn test_dropped_handle_reports_lost() {
        let board = CompletionBoard::new();
        drop(board.register(RequestId(3)).unwrap());
        let status = board.wait(RequestId(3), Duration::from_millis(10)).unwrap();
        assert_eq!(DispatchError::from_errno(status), DispatchError::MessageLost);
    }

    #[test]
    fn test_unbounded_timeout_waits_for_completion() {
        let board = CompletionBoard::new();
        board.register(RequestId(3)).unwrap().complete(0);
        assert_eq!(board.wait(RequestId(3), Duration::MAX), Ok(0));

        let handle = board.register(RequestId(5)).unwrap();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.complete(libc::ETIMEDOUT);
        });
        let status = board.wait(RequestId(5), Duration::MAX).unwrap();
        assert_eq!(DispatchError::from_errno(status), DispatchError::Timeout);
        worker.join().unwrap();
    }

    #[test]
    fn test_depth_limit() {
        let board = CompletionBoard::with_depth(2);
        let _a = board.register(RequestId(1)).unwrap();
        let _b = board.register(RequestId(2)).unwrap();
        assert!(matches!(board.register(RequestId(3)), Err(DispatchError::QueueFull)));
    }

    #[test]
    fn test_cancel_forgets_request() {
        let board = CompletionBoard::new();
        let handle = board.register(RequestId(4)).unwrap();
        board.cancel(RequestId(4));
        handle.complete(0);
        assert_eq!(board.pending(), 0);
        assert_eq!(
            board.wait(RequestId(4), Duration::from_millis(1)),
            Err(DispatchError::MessageLost)
        );
    }
}
