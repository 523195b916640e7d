use crate::monitor::ConnectivityState;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Label shown next to the app header for a given state.
pub fn indicator(state: ConnectivityState) -> &'static str {
    match state {
        ConnectivityState::Unknown => "… checking",
        ConnectivityState::Connected => "● online",
        ConnectivityState::Disconnected => "○ offline",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    pub at_unix_ms: u128,
}

/// Renders connectivity changes and keeps the most recent ones.
#[derive(Clone)]
pub struct StatusBoard {
    history: Arc<Mutex<VecDeque<Transition>>>,
    max_history: usize,
}

impl StatusBoard {
    pub fn new(max_history: usize) -> Self {
        StatusBoard {
            history: Arc::new(Mutex::new(VecDeque::with_capacity(max_history))),
            max_history,
        }
    }

    /// Follows `rx` until the sender goes away. Repeated publishes of the same
    /// state are not transitions and are skipped.
    pub async fn follow(&self, mut rx: watch::Receiver<ConnectivityState>) {
        let mut current = *rx.borrow_and_update();
        tracing::info!("backend {}", indicator(current));

        while rx.changed().await.is_ok() {
            let next = *rx.borrow_and_update();
            if next == current {
                continue;
            }
            self.record(current, next).await;
            current = next;
        }
    }

    pub async fn record(&self, from: ConnectivityState, to: ConnectivityState) {
        match to {
            ConnectivityState::Disconnected => tracing::warn!("backend {}", indicator(to)),
            _ => tracing::info!("backend {}", indicator(to)),
        }

        let at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut history = self.history.lock().await;
        history.push_back(Transition {
            from,
            to,
            at_unix_ms,
        });
        if history.len() > self.max_history {
            history.pop_front();
        }
    }

    pub async fn history(&self) -> Vec<Transition> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn latest(&self) -> Option<Transition> {
        self.history.lock().await.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StateSink;
    use ConnectivityState::*;

    #[test]
    fn test_indicator_labels() {
        assert_eq!(indicator(Connected), "● online");
        assert_eq!(indicator(Disconnected), "○ offline");
        assert_eq!(indicator(Unknown), "… checking");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let board = StatusBoard::new(3);
        for i in 0..5 {
            let (from, to) = if i % 2 == 0 {
                (Connected, Disconnected)
            } else {
                (Disconnected, Connected)
            };
            board.record(from, to).await;
        }

        let history = board.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].to, Disconnected);
        assert_eq!(history[2].to, Disconnected);
        assert_eq!(board.latest().await.unwrap().from, Connected);
    }

    #[tokio::test]
    async fn test_follow_records_only_real_changes() {
        let (tx, rx) = watch::channel(Unknown);
        let board = StatusBoard::new(8);
        let follower = {
            let board = board.clone();
            tokio::spawn(async move { board.follow(rx).await })
        };
        tokio::task::yield_now().await;

        for state in [Connected, Connected, Disconnected, Disconnected, Connected] {
            tx.publish(state);
            tokio::task::yield_now().await;
        }
        drop(tx);
        follower.await.unwrap();

        let seen: Vec<_> = board.history().await.into_iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            seen,
            vec![
                (Unknown, Connected),
                (Connected, Disconnected),
                (Disconnected, Connected)
            ]
        );
    }
}
