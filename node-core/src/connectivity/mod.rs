//! Connectivity manager: wireless association and the broker session.
//!
//! Both lifecycles are driven by polling. Association retries forever at a
//! fixed cadence; the session handshake retries forever with a fixed backoff
//! but hands control back as soon as the link underneath it disappears.

use core::{fmt, net::Ipv4Addr};

use embedded_hal_async::delay::DelayNs;

use crate::config::{BrokerConfig, CycleTiming, WifiCredentials};
use crate::delay_millis;
use crate::events::{EventSink, NodeEvent};

/// Connectivity as seen by the cycle controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Unassociated,
    AssociatedNoSession,
    SessionActive,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unassociated => f.write_str("unassociated"),
            SessionState::AssociatedNoSession => f.write_str("associated"),
            SessionState::SessionActive => f.write_str("session-active"),
        }
    }
}

/// Why a session could not be opened.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionError {
    Resolve,
    Connect,
    Tls,
    /// Broker answered CONNECT with a non-success reason code.
    Refused(u8),
    Protocol,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Resolve => f.write_str("dns lookup failed"),
            SessionError::Connect => f.write_str("tcp connect failed"),
            SessionError::Tls => f.write_str("tls handshake failed"),
            SessionError::Refused(code) => write!(f, "refused, rc={code}"),
            SessionError::Protocol => f.write_str("protocol error"),
        }
    }
}

/// Why a single publish did not go out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishError {
    NoSession,
    BufferFull,
    Transport,
    Rejected,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NoSession => f.write_str("no session"),
            PublishError::BufferFull => f.write_str("send buffer full"),
            PublishError::Transport => f.write_str("transport error"),
            PublishError::Rejected => f.write_str("rejected by broker"),
        }
    }
}

/// Station-mode wireless link.
#[allow(async_fn_in_trait)]
pub trait WirelessLink {
    /// Drops any association and returns the radio to a clean station mode.
    async fn restart_station(&mut self);

    /// Starts associating. Completion is observed through [`is_associated`](Self::is_associated).
    async fn begin(&mut self, credentials: &WifiCredentials);

    fn is_associated(&self) -> bool;

    fn address(&self) -> Option<Ipv4Addr>;
}

/// Authenticated publish/subscribe session over the link.
#[allow(async_fn_in_trait)]
pub trait BrokerSession {
    /// One handshake attempt.
    async fn open(&mut self, broker: &BrokerConfig) -> Result<(), SessionError>;

    fn is_active(&self) -> bool;

    /// One publish attempt; never retries internally.
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishError>;

    /// Keep-alive and inbound traffic. Called at least every idle interval.
    async fn pump(&mut self);
}

/// Association LED.
pub trait StatusIndicator {
    fn set(&mut self, on: bool);
    fn toggle(&mut self);
}

impl<T: StatusIndicator + ?Sized> StatusIndicator for &mut T {
    fn set(&mut self, on: bool) {
        (**self).set(on);
    }

    fn toggle(&mut self) {
        (**self).toggle();
    }
}

/// Whether an association poll loop may keep going.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollVerdict {
    Continue,
    Abort,
}

/// Work run once per association poll. Setup-time association uses this to
/// service the power button before its task exists.
#[allow(async_fn_in_trait)]
pub trait AssociationHook {
    async fn on_poll(&mut self) -> PollVerdict;
}

impl AssociationHook for () {
    async fn on_poll(&mut self) -> PollVerdict {
        PollVerdict::Continue
    }
}

impl<T: AssociationHook + ?Sized> AssociationHook for &mut T {
    async fn on_poll(&mut self) -> PollVerdict {
        (**self).on_poll().await
    }
}

/// Result of [`ConnectivityManager::ensure_associated`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Association {
    AlreadyAssociated,
    Associated { address: Option<Ipv4Addr>, polls: u32 },
    /// The hook asked to stop polling.
    Aborted,
}

/// Owns the link, the session and the association LED.
pub struct ConnectivityManager<L, S, I, D> {
    link: L,
    session: S,
    indicator: I,
    delay: D,
    timing: CycleTiming,
}

impl<L, S, I, D> ConnectivityManager<L, S, I, D>
where
    L: WirelessLink,
    S: BrokerSession,
    I: StatusIndicator,
    D: DelayNs,
{
    #[must_use]
    pub const fn new(link: L, session: S, indicator: I, delay: D, timing: CycleTiming) -> Self {
        Self {
            link,
            session,
            indicator,
            delay,
            timing,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if !self.link.is_associated() {
            SessionState::Unassociated
        } else if self.session.is_active() {
            SessionState::SessionActive
        } else {
            SessionState::AssociatedNoSession
        }
    }

    #[must_use]
    pub fn is_associated(&self) -> bool {
        self.link.is_associated()
    }

    #[must_use]
    pub fn is_session_active(&self) -> bool {
        self.session.is_active()
    }

    /// Blocks until associated, polling at the association cadence and
    /// blinking the LED on every poll.
    pub async fn ensure_associated<H, E>(
        &mut self,
        credentials: &WifiCredentials,
        hook: &mut H,
        events: &mut E,
    ) -> Association
    where
        H: AssociationHook,
        E: EventSink,
    {
        if self.link.is_associated() {
            return Association::AlreadyAssociated;
        }

        events.record(&NodeEvent::AssociationStarted {
            ssid: credentials.ssid,
        });
        self.link.restart_station().await;
        self.delay
            .delay_ms(delay_millis(self.timing.station_settle))
            .await;
        self.link.begin(credentials).await;

        let mut polls: u32 = 0;
        while !self.link.is_associated() {
            self.delay
                .delay_ms(delay_millis(self.timing.association_poll))
                .await;
            polls = polls.saturating_add(1);
            self.indicator.toggle();
            events.record(&NodeEvent::AssociationPoll { attempt: polls });
            if hook.on_poll().await == PollVerdict::Abort {
                return Association::Aborted;
            }
        }

        self.indicator.set(false);
        let address = self.link.address();
        events.record(&NodeEvent::Associated { address });
        Association::Associated { address, polls }
    }

    /// Opens the session, retrying after the backoff window until it succeeds.
    /// Returns `false` only when the link drops while retrying.
    pub async fn ensure_session<E: EventSink>(
        &mut self,
        broker: &BrokerConfig,
        events: &mut E,
    ) -> bool {
        if self.session.is_active() {
            return true;
        }

        loop {
            if !self.link.is_associated() {
                events.record(&NodeEvent::SessionDeferred);
                return false;
            }

            events.record(&NodeEvent::SessionAttempt {
                host: broker.host,
                port: broker.port,
            });
            match self.session.open(broker).await {
                Ok(()) => {
                    events.record(&NodeEvent::SessionOpened);
                    return true;
                }
                Err(error) => {
                    events.record(&NodeEvent::SessionRejected {
                        error,
                        retry_in: self.timing.session_backoff,
                    });
                    self.delay
                        .delay_ms(delay_millis(self.timing.session_backoff))
                        .await;
                }
            }
        }
    }

    /// Exactly one publish attempt.
    ///
    /// # Errors
    ///
    /// Whatever the session reports; the caller decides what a failure means.
    pub async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if !self.session.is_active() {
            return Err(PublishError::NoSession);
        }
        self.session.publish(topic, payload).await
    }

    pub async fn pump(&mut self) {
        self.session.pump().await;
    }
}
