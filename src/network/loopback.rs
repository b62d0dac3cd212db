//! Loopback Relay
//!
//! Plays the part of two linked core processes inside one runtime: it
//! reports the usual connect sequence to both sessions, relays smuggled
//! payloads between them in order, and acknowledges start requests with
//! `Running` before ending that side's stream, the way a real core exits
//! when its match ends. Used by the demo binary and the session tests.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::bridge::{CoreEndpoint, CoreEvents};
use super::protocol::{CoreState, StartRequest, ToCore};

/// One side of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    /// First endpoint.
    A,
    /// Second endpoint.
    B,
}

impl RelaySide {
    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Hook that may rewrite a payload in flight. Receives the sending side.
pub type TamperFn = Box<dyn FnMut(RelaySide, &mut Vec<u8>) + Send>;

/// Relay behavior knobs.
#[derive(Default)]
pub struct RelayOptions {
    /// Payload rewriting, for exercising an untrusted relay.
    pub tamper: Option<TamperFn>,
}

/// What the relay observed, returned when both sides are gone.
#[derive(Debug, Default)]
pub struct RelayReport {
    /// Start requests received, in order.
    pub starts: Vec<(RelaySide, StartRequest)>,
    /// Payloads relayed between the sides.
    pub relayed: usize,
    /// Side that sent a stop request first, if any.
    pub stopped_by: Option<RelaySide>,
}

struct Leg {
    requests: Option<mpsc::Receiver<ToCore>>,
    events: Option<CoreEvents>,
}

impl From<CoreEndpoint> for Leg {
    fn from(endpoint: CoreEndpoint) -> Self {
        Self {
            requests: Some(endpoint.requests),
            events: Some(endpoint.events),
        }
    }
}

impl Leg {
    async fn indicate(&self, state: CoreState) {
        if let Some(events) = &self.events {
            if events.indicate(state).await.is_err() {
                debug!("session side of the relay is gone");
            }
        }
    }

    async fn deliver(&self, payload: Vec<u8>) {
        if let Some(events) = &self.events {
            if events.deliver(payload).await.is_err() {
                debug!("session side of the relay is gone");
            }
        }
    }
}

async fn next_request(requests: &mut Option<mpsc::Receiver<ToCore>>) -> Option<ToCore> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Link two core endpoints back to back.
pub fn spawn_loopback(a: CoreEndpoint, b: CoreEndpoint, mut options: RelayOptions) -> JoinHandle<RelayReport> {
    tokio::spawn(async move {
        let mut legs = [Leg::from(a), Leg::from(b)];
        let mut report = RelayReport::default();

        for state in [CoreState::Connecting, CoreState::Waiting, CoreState::Starting] {
            for leg in &legs {
                leg.indicate(state).await;
            }
        }

        while legs.iter().any(|leg| leg.requests.is_some()) {
            let (side, request) = {
                let [leg_a, leg_b] = &mut legs;
                tokio::select! {
                    r = next_request(&mut leg_a.requests) => (RelaySide::A, r),
                    r = next_request(&mut leg_b.requests) => (RelaySide::B, r),
                }
            };

            match request {
                Some(ToCore::Smuggle(mut payload)) => {
                    if let Some(tamper) = options.tamper.as_mut() {
                        tamper(side, &mut payload);
                    }
                    legs[side.other().index()].deliver(payload).await;
                    report.relayed += 1;
                }
                Some(ToCore::Start(start)) => {
                    info!(?side, game = %start.game, "relay: match started");
                    let leg = &mut legs[side.index()];
                    leg.indicate(CoreState::Running).await;
                    leg.events = None;
                    report.starts.push((side, start));
                }
                Some(ToCore::Stop) => {
                    info!(?side, "relay: stop requested");
                    report.stopped_by.get_or_insert(side);
                    for leg in &mut legs {
                        leg.events = None;
                    }
                    legs[side.index()].requests = None;
                }
                None => {
                    debug!(?side, "relay: session dropped its bridge");
                    let leg = &mut legs[side.index()];
                    leg.requests = None;
                    leg.events = None;
                }
            }
        }

        report
    })
}
