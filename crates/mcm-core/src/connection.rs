//! The polymorphic bridge element: state machine, link
//! graph, metrics and common validation shared by every transport.

use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::broker::{EventBroker, EventKind};
use crate::context::Context;
use crate::error::{McmError, Result};
use crate::metrics::Metrics;

const CTX_CONFIGURE: &str = "connection.configure";
const CTX_ESTABLISH: &str = "connection.establish";
const CTX_SUSPEND: &str = "connection.suspend";
const CTX_RESUME: &str = "connection.resume";
const CTX_SHUTDOWN: &str = "connection.shutdown";
const CTX_SET_LINK: &str = "connection.set_link";
const CTX_TRANSMIT: &str = "connection.transmit";

/// Which side of the wire/app boundary a connection represents. Immutable
/// after construction; governs link compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Transmitter,
    Receiver,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Kind::Transmitter => "transmitter",
            Kind::Receiver => "receiver",
        })
    }
}

/// Connection lifecycle: `closed` is terminal for the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NotConfigured,
    Configured,
    Active,
    Suspended,
    Closed,
}

/// Shared state every `Connection` implementation composes: the state
/// machine, link graph, metrics and last-result slot. Transport-specific
/// data lives alongside a `ConnectionBase` field in the concrete type; the
/// trait's default methods (see [`Connection`]) drive it.
pub struct ConnectionBase {
    id: String,
    kind: Kind,
    state: Mutex<State>,
    link: RwLock<Option<Arc<dyn Connection>>>,
    feeder: Mutex<Option<Weak<dyn Connection>>>,
    self_weak: Mutex<Option<Weak<dyn Connection>>>,
    broker: Mutex<Option<Arc<EventBroker>>>,
    metrics: Metrics,
    last_result: Mutex<Option<String>>,
}

impl ConnectionBase {
    pub fn new(id: impl Into<String>, kind: Kind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: Mutex::new(State::NotConfigured),
            link: RwLock::new(None),
            feeder: Mutex::new(None),
            self_weak: Mutex::new(None),
            broker: Mutex::new(None),
            metrics: Metrics::new(),
            last_result: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn last_result(&self) -> Option<String> {
        self.last_result.lock().unwrap().clone()
    }

    fn set_result(&self, result: &Result<()>) {
        let mut slot = self.last_result.lock().unwrap();
        *slot = result.as_ref().err().map(|e| e.to_string());
    }

    /// Attaches the broker used to publish link-change events. Optional —
    /// a connection with no broker attached simply skips event delivery.
    pub fn attach_broker(&self, broker: Arc<EventBroker>) {
        *self.broker.lock().unwrap() = Some(broker);
    }

    /// Must be called once, immediately after the concrete connection is
    /// wrapped in an `Arc<dyn Connection>` (see [`wrap`]), so the base can
    /// hand out a weak self-reference for back-reference wiring.
    fn bind_self_weak(&self, weak: Weak<dyn Connection>) {
        *self.self_weak.lock().unwrap() = Some(weak);
    }

    fn set_feeder(&self, feeder: Weak<dyn Connection>) {
        *self.feeder.lock().unwrap() = Some(feeder);
    }

    /// Upgrades the connection's own self-reference, bound by [`wrap`] at
    /// construction. Lets a worker thread spawned from `on_establish(&self,
    /// ..)` call back into `transmit`/`shutdown` through an owned `Arc`
    /// instead of a borrow that cannot outlive the spawning call. Returns
    /// `None` only if the connection was never constructed through `wrap`.
    pub fn self_arc(&self) -> Option<Arc<dyn Connection>> {
        self.self_weak.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// The upstream connection currently feeding this one, if any and if
    /// still alive. Weak: never used for ownership, only event delivery.
    pub fn feeder(&self) -> Option<Arc<dyn Connection>> {
        self.feeder.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }
}

/// The five-callback subclass contract, implemented per
/// transport. Invoked exactly once per corresponding public call by the
/// `Connection` trait's default methods.
pub trait Connection: Send + Sync {
    fn base(&self) -> &ConnectionBase;

    /// Subclass starts workers; on success the caller transitions state to
    /// `active`.
    fn on_establish(&self, ctx: &Context) -> Result<()>;

    /// Subclass signals workers and blocks until they stop.
    fn on_shutdown(&self, ctx: &Context) -> Result<()>;

    /// Called by an upstream connection's `transmit`; fills `sent` with the
    /// number of bytes accepted.
    fn on_receive(&self, ctx: &Context, data: &[u8], sent: &mut usize) -> Result<()>;

    /// Subclass validates and stores its transport-specific configuration.
    /// Most transports have nothing to do here beyond argument validation,
    /// hence the no-op default.
    fn on_configure(&self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn id(&self) -> &str {
        self.base().id()
    }

    fn kind(&self) -> Kind {
        self.base().kind()
    }

    fn state(&self) -> State {
        self.base().state()
    }

    fn metrics(&self) -> &Metrics {
        self.base().metrics()
    }

    fn link(&self) -> Option<Arc<dyn Connection>> {
        self.base().link.read().unwrap().clone()
    }

    /// Sets the forward link, validating kind compatibility (a receiver may
    /// not forward to a transmitter) and updating both endpoints' back-
    /// references. Displacing an existing link fires
    /// `conn_unlink_requested` on the displaced peer.
    fn set_link(
        &self,
        ctx: &Context,
        peer: Option<Arc<dyn Connection>>,
        requester: Option<Arc<dyn Connection>>,
    ) -> Result<()> {
        let _ = ctx;
        if let Some(ref peer) = peer {
            if self.kind() == Kind::Receiver && peer.kind() == Kind::Transmitter {
                return Err(McmError::bad_argument(CTX_SET_LINK));
            }
        }

        let base = self.base();
        let previous = {
            let mut slot = base.link.write().unwrap();
            std::mem::replace(&mut *slot, peer.clone())
        };

        if let Some(peer) = &peer {
            if peer.kind() == Kind::Receiver {
                if let Some(self_weak) = base.self_weak.lock().unwrap().clone() {
                    peer.base().set_feeder(self_weak);
                }
            }
        }

        if let Some(previous) = previous {
            let same = peer.as_ref().is_some_and(|p| Arc::ptr_eq(&previous, p));
            if !same {
                notify_unlink(base, &previous, requester.as_ref());
            }
        }

        Ok(())
    }

    /// First transition out of `not_configured`, or a re-configure after
    /// `shutdown` has returned the connection to `closed`. Calling it from
    /// any other state (already configured, active, suspended) is a state
    /// error.
    fn configure(&self, ctx: &Context) -> Result<()> {
        {
            let mut state = self.base().state.lock().unwrap();
            if *state != State::NotConfigured && *state != State::Closed {
                return Err(McmError::wrong_state(CTX_CONFIGURE, "already configured"));
            }
            *state = State::Configured;
        }
        let result = self.on_configure(ctx);
        if result.is_err() {
            self.base().set_state(State::Closed);
        }
        result
    }

    fn establish(&self, ctx: &Context) -> Result<()> {
        let base = self.base();
        {
            let mut state = base.state.lock().unwrap();
            match *state {
                State::Configured | State::Suspended => *state = State::Active,
                State::Active => return Err(McmError::wrong_state(CTX_ESTABLISH, "already active")),
                other => {
                    return Err(McmError::wrong_state(
                        CTX_ESTABLISH,
                        format!("cannot establish from {other:?}"),
                    ))
                }
            }
        }
        let result = self.on_establish(ctx);
        base.set_result(&result);
        if result.is_err() {
            base.set_state(State::Closed);
        }
        result
    }

    fn suspend(&self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        let base = self.base();
        let mut state = base.state.lock().unwrap();
        if *state != State::Active {
            return Err(McmError::wrong_state(CTX_SUSPEND, "not active"));
        }
        *state = State::Suspended;
        Ok(())
    }

    fn resume(&self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        let base = self.base();
        let mut state = base.state.lock().unwrap();
        if *state != State::Suspended {
            return Err(McmError::wrong_state(CTX_RESUME, "not suspended"));
        }
        *state = State::Active;
        Ok(())
    }

    fn shutdown(&self, ctx: &Context) -> Result<()> {
        let base = self.base();
        {
            let state = base.state.lock().unwrap();
            if *state == State::Closed {
                return Ok(()); // idempotent
            }
        }
        let result = self.on_shutdown(ctx);
        base.set_state(State::Closed);
        base.set_result(&result);
        result
    }

    /// Forwards to the link's `on_receive`; updates outbound counters on
    /// success, failure counters on error.
    fn transmit(&self, ctx: &Context, data: &[u8]) -> Result<usize> {
        let base = self.base();
        if base.state() != State::Active {
            return Err(McmError::wrong_state(CTX_TRANSMIT, "not active"));
        }
        let Some(link) = self.link() else {
            return Err(McmError::NoLinkAssigned {
                context: CTX_TRANSMIT,
            });
        };

        let mut sent = 0usize;
        match link.on_receive(ctx, data, &mut sent) {
            Ok(()) => {
                base.metrics().record_outbound_success(sent as u64);
                link.base().metrics().record_inbound_success(sent as u64);
                Ok(sent)
            }
            Err(err) => {
                base.metrics().record_failure();
                Err(err)
            }
        }
    }
}

fn notify_unlink(base: &ConnectionBase, displaced: &Arc<dyn Connection>, requester: Option<&Arc<dyn Connection>>) {
    let Some(broker) = base.broker.lock().unwrap().clone() else {
        return;
    };
    let ctx = Context::background();
    let mut params = vec![("displaced_id".to_string(), displaced.id().to_string())];
    if let Some(requester) = requester {
        params.push(("requester_id".to_string(), requester.id().to_string()));
    }
    broker.send(&ctx, displaced.id().to_string(), EventKind::ConnUnlinkRequested, params);
}

/// Wraps a freshly constructed connection in an `Arc<dyn Connection>` and
/// binds its self-reference so `set_link`'s back-reference wiring works.
/// Every concrete connection must be constructed through this helper.
pub fn wrap<C: Connection + 'static>(conn: C) -> Arc<dyn Connection> {
    let arc: Arc<dyn Connection> = Arc::new(conn);
    arc.base().bind_self_weak(Arc::downgrade(&arc));
    arc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sink {
        base: ConnectionBase,
        received: AtomicUsize,
    }

    impl Sink {
        fn new(id: &str) -> Self {
            Self {
                base: ConnectionBase::new(id, Kind::Receiver),
                received: AtomicUsize::new(0),
            }
        }
    }

    impl Connection for Sink {
        fn base(&self) -> &ConnectionBase {
            &self.base
        }
        fn on_establish(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_receive(&self, _ctx: &Context, data: &[u8], sent: &mut usize) -> Result<()> {
            self.received.fetch_add(data.len(), Ordering::SeqCst);
            *sent = data.len();
            Ok(())
        }
    }

    struct Source {
        base: ConnectionBase,
    }

    impl Source {
        fn new(id: &str) -> Self {
            Self {
                base: ConnectionBase::new(id, Kind::Transmitter),
            }
        }
    }

    impl Connection for Source {
        fn base(&self) -> &ConnectionBase {
            &self.base
        }
        fn on_establish(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_shutdown(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn on_receive(&self, _ctx: &Context, _data: &[u8], _sent: &mut usize) -> Result<()> {
            unreachable!("Source never receives")
        }
    }

    fn configured_and_active(conn: &Arc<dyn Connection>, ctx: &Context) {
        conn.configure(ctx).unwrap();
        conn.establish(ctx).unwrap();
    }

    #[test]
    fn link_and_transmit_updates_metrics() {
        let ctx = Context::background();
        let sink = wrap(Sink::new("sink"));
        let source = wrap(Source::new("source"));

        configured_and_active(&sink, &ctx);
        configured_and_active(&source, &ctx);
        source.set_link(&ctx, Some(sink.clone()), None).unwrap();

        let n = source.transmit(&ctx, b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(source.metrics().transactions_successful(), 1);
        assert_eq!(source.metrics().outbound_bytes(), 5);
        assert_eq!(sink.metrics().inbound_bytes(), 5);
    }

    #[test]
    fn transmit_without_link_errors() {
        let ctx = Context::background();
        let source = wrap(Source::new("source"));
        configured_and_active(&source, &ctx);
        let err = source.transmit(&ctx, b"x").unwrap_err();
        assert!(matches!(err, McmError::NoLinkAssigned { .. }));
    }

    #[test]
    fn set_link_rejects_receiver_to_transmitter() {
        let ctx = Context::background();
        let a = wrap(Sink::new("a"));
        let b = wrap(Source::new("b"));
        let err = a.set_link(&ctx, Some(b), None).unwrap_err();
        assert!(matches!(err, McmError::BadArgument { .. }));
        assert!(a.link().is_none());
    }

    #[test]
    fn establish_twice_is_wrong_state() {
        let ctx = Context::background();
        let source = wrap(Source::new("source"));
        configured_and_active(&source, &ctx);
        let err = source.establish(&ctx).unwrap_err();
        assert!(matches!(err, McmError::WrongState { .. }));
    }

    #[test]
    fn configure_twice_is_wrong_state() {
        let ctx = Context::background();
        let source = wrap(Source::new("source"));
        source.configure(&ctx).unwrap();
        let err = source.configure(&ctx).unwrap_err();
        assert!(matches!(err, McmError::WrongState { .. }));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let ctx = Context::background();
        let source = wrap(Source::new("source"));
        configured_and_active(&source, &ctx);
        source.shutdown(&ctx).unwrap();
        assert_eq!(source.state(), State::Closed);
        source.shutdown(&ctx).unwrap();
        assert_eq!(source.state(), State::Closed);
    }

    #[test]
    fn configure_after_shutdown_is_allowed() {
        let ctx = Context::background();
        let source = wrap(Source::new("source"));
        configured_and_active(&source, &ctx);
        source.shutdown(&ctx).unwrap();
        assert_eq!(source.state(), State::Closed);

        source.configure(&ctx).unwrap();
        assert_eq!(source.state(), State::Configured);
        source.establish(&ctx).unwrap();
        assert_eq!(source.state(), State::Active);
    }

    #[test]
    fn suspend_resume_preserves_metrics() {
        let ctx = Context::background();
        let sink = wrap(Sink::new("sink"));
        let source = wrap(Source::new("source"));
        configured_and_active(&sink, &ctx);
        configured_and_active(&source, &ctx);
        source.set_link(&ctx, Some(sink.clone()), None).unwrap();
        source.transmit(&ctx, b"abc").unwrap();

        source.suspend(&ctx).unwrap();
        source.resume(&ctx).unwrap();
        assert_eq!(source.metrics().outbound_bytes(), 3);
    }

    #[test]
    fn zero_length_transmit_succeeds() {
        let ctx = Context::background();
        let sink = wrap(Sink::new("sink"));
        let source = wrap(Source::new("source"));
        configured_and_active(&sink, &ctx);
        configured_and_active(&source, &ctx);
        source.set_link(&ctx, Some(sink.clone()), None).unwrap();
        let n = source.transmit(&ctx, &[]).unwrap();
        assert_eq!(n, 0);
    }
}
