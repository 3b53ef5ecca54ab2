use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use base64::Engine;
use futures::AsyncReadExt;
use http_client::{AsyncBody, HttpClient, HttpRequestExt, RedirectPolicy};

use crate::error::{Error, Result};

const ANNOUNCE_HEADER: &str = "announce";
const ANNOUNCE_PREFIX: &str = "base64:";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the supervisor needs from one subscription response.
#[derive(Clone, Debug, Default)]
pub struct Reply {
    pub status: u16,
    /// Raw `Announce` header value, if the server sent one.
    pub announce: Option<String>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decoded rejection reason. A blank `Announce` header is not a rejection.
    pub fn rejection(&self) -> Option<String> {
        self.announce
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(decode_announce)
    }
}

pub trait SubscriptionClient: Send {
    fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<Reply>;
}

/// Shared flag another thread trips to abandon the in-flight request.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct HttpSubscriptionClient {
    http_client: Arc<dyn HttpClient>,
    timeout: Duration,
    cancel: CancelToken,
}

impl HttpSubscriptionClient {
    pub fn new(http_client: Arc<dyn HttpClient>, timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            http_client,
            timeout,
            cancel,
        }
    }
}

impl SubscriptionClient for HttpSubscriptionClient {
    fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<Reply> {
        log::info!("[config] GET {url}");
        let http_client = self.http_client.clone();
        let url = url.to_string();
        let headers: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        run_bounded(self.timeout, &self.cancel, move || {
            fetch_blocking(&http_client, &url, &headers)
        })
    }
}

fn fetch_blocking(
    http_client: &Arc<dyn HttpClient>,
    url: &str,
    headers: &[(String, String)],
) -> Result<Reply> {
    let mut request = http_client::Request::get(url).follow_redirects(RedirectPolicy::FollowAll);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let request = request
        .body(AsyncBody::empty())
        .map_err(|error| Error::Transport(format!("Failed to build request: {error}")))?;

    let mut response = futures::executor::block_on(http_client.send(request))
        .map_err(|error| Error::Transport(format!("HTTP request failed: {error}")))?;

    let status = response.status().as_u16();
    let announce = response
        .headers()
        .get(ANNOUNCE_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string);

    let mut body = Vec::new();
    futures::executor::block_on(response.body_mut().read_to_end(&mut body))
        .map_err(|error| Error::Transport(format!("Failed to read response body: {error}")))?;

    Ok(Reply {
        status,
        announce,
        body,
    })
}

/// Runs `work` on a worker thread and waits at most `timeout` for it, giving up
/// early when `cancel` is tripped. An abandoned worker finishes in the background.
pub fn run_bounded<T, F>(timeout: Duration, cancel: &CancelToken, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let _ = sender.send(work());
    });

    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            log::info!("[config] request cancelled");
            return Err(Error::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Transport(format!(
                "Request timed out after {} s",
                timeout.as_secs()
            )));
        }
        match receiver.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Transport("Request worker exited".to_string()));
            }
        }
    }
}

/// `base64:<payload>` becomes the decoded payload; anything else is returned verbatim.
pub fn decode_announce(value: &str) -> String {
    let value = value.trim();
    let Some(encoded) = value.strip_prefix(ANNOUNCE_PREFIX) else {
        return value.to_string();
    };
    match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(error) => {
            log::warn!("[config] undecodable Announce header: {error}");
            value.to_string()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_is_decoded() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("Подписка истекла");
        assert_eq!(decode_announce(&format!("base64:{encoded}")), "Подписка истекла");
    }

    #[test]
    fn announce_without_prefix_is_kept_raw() {
        assert_eq!(decode_announce("Subscription expired"), "Subscription expired");
        assert_eq!(decode_announce("base64:%%%"), "base64:%%%");
    }

    #[test]
    fn blank_announce_is_not_a_rejection() {
        let reply = |announce: Option<&str>| Reply {
            status: 200,
            announce: announce.map(str::to_string),
            body: Vec::new(),
        };
        assert_eq!(reply(None).rejection(), None);
        assert_eq!(reply(Some("")).rejection(), None);
        assert_eq!(reply(Some("  ")).rejection(), None);
        assert_eq!(reply(Some("Expired")).rejection().as_deref(), Some("Expired"));
    }

    #[test]
    fn bounded_work_returns_result() {
        let value = run_bounded(Duration::from_secs(5), &CancelToken::new(), || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn bounded_work_times_out() {
        let started = Instant::now();
        let result = run_bounded(Duration::from_millis(200), &CancelToken::new(), || {
            thread::sleep(Duration::from_secs(5));
            Ok(())
        });
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cancel_abandons_work() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let result = run_bounded(Duration::from_secs(30), &cancel, || {
            thread::sleep(Duration::from_secs(5));
            Ok(())
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(4));

        cancel.reset();
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn reply_success_range() {
        let reply = |status| Reply {
            status,
            ..Reply::default()
        };
        assert!(reply(200).is_success());
        assert!(reply(204).is_success());
        assert!(!reply(302).is_success());
        assert!(!reply(500).is_success());
    }
}
