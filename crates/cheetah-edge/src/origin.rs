use std::sync::Arc;

use tokio::sync::watch;

/// Read side of the current upstream origin (e.g. `https://uploads.mangadex.org`).
#[derive(Clone, Debug)]
pub struct OriginHandle {
    receiver: watch::Receiver<Arc<str>>,
}

impl OriginHandle {
    /// A handle that never changes, for statically configured upstreams.
    pub fn fixed(origin: impl Into<Arc<str>>) -> Self {
        let (_controller, handle) = OriginController::new(origin);
        handle
    }

    pub fn current(&self) -> Arc<str> {
        Arc::clone(&self.receiver.borrow())
    }

    /// Join the origin with a path that starts with `/`.
    pub fn url_for(&self, path: &str) -> String {
        let origin = self.current();
        format!("{}{path}", origin.trim_end_matches('/'))
    }
}

/// Write side, held by whoever learns about origin changes.
#[derive(Clone, Debug)]
pub struct OriginController {
    sender: Arc<watch::Sender<Arc<str>>>,
}

impl OriginController {
    pub fn new(initial: impl Into<Arc<str>>) -> (Self, OriginHandle) {
        let (sender, receiver) = watch::channel(initial.into());
        (
            Self {
                sender: Arc::new(sender),
            },
            OriginHandle { receiver },
        )
    }

    pub fn subscribe(&self) -> OriginHandle {
        OriginHandle {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish a new origin; returns whether it differed from the previous one.
    pub fn update(&self, origin: &str) -> bool {
        self.sender.send_if_modified(|current| {
            if current.as_ref() == origin {
                false
            } else {
                *current = Arc::from(origin);
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_observe_updates() {
        let (controller, handle) = OriginController::new("https://a.example");
        let late = controller.subscribe();
        assert!(controller.update("https://b.example/"));
        assert!(!controller.update("https://b.example/"));
        assert_eq!(&*handle.current(), "https://b.example/");
        assert_eq!(late.url_for("/data/x.png"), "https://b.example/data/x.png");
    }

    #[test]
    fn fixed_handle_keeps_value_after_sender_drop() {
        let handle = OriginHandle::fixed("http://127.0.0.1:9000");
        assert_eq!(handle.url_for("/a"), "http://127.0.0.1:9000/a");
    }
}
