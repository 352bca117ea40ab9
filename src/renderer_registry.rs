//! Renderer (cast target) registry.
//!
//! Tracks the renderers reported by discovery sources and which one playback
//! is routed to. A selection is either global (kept across playback
//! sessions) or temporary (used for one remote session and reverted by
//! [`RendererRegistry::restore_renderer`]). Every change is published on the
//! shared bus while the registry lock is held, so listeners see changes in
//! the order they happened.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;

use crate::config::RendererConfig;
use crate::error::DiscoveryError;
use crate::protocol::{Message, RendererMessage};

/// What kind of target a renderer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    /// Plain cast target fed by the local player.
    Cast,
    /// Remote device running its own P2P engine.
    P2pDevice {
        /// AceCast devices cannot be matched to a cast target by address.
        ace_cast: bool,
    },
}

/// One discovered renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererItem {
    pub id: String,
    pub name: String,
    pub kind: RendererKind,
    pub address: String,
    pub port: u16,
    pub model: String,
}

impl RendererItem {
    pub fn is_p2p_device(&self) -> bool {
        matches!(self.kind, RendererKind::P2pDevice { .. })
    }

    /// Identity check. In non-strict mode a cast target and a non-AceCast P2P
    /// device on the same address are the same physical renderer.
    pub fn matches(&self, other: &RendererItem, strict: bool) -> bool {
        let same_family = self.is_p2p_device() == other.is_p2p_device();
        if same_family {
            return self.id == other.id;
        }
        if strict {
            return false;
        }
        let bridgeable = |item: &RendererItem| {
            matches!(
                item.kind,
                RendererKind::Cast | RendererKind::P2pDevice { ace_cast: false }
            )
        };
        bridgeable(self) && bridgeable(other) && self.address == other.address
    }
}

impl fmt::Display for RendererItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Renderer: kind={:?} id={}>", self.kind, self.id)
    }
}

/// A source of renderer items.
pub trait RendererDiscoverer: Send {
    fn name(&self) -> &str;
    /// Starts reporting items to `sink`.
    fn start(&mut self, sink: DiscoverySink) -> Result<(), DiscoveryError>;
    fn stop(&mut self);
    /// Released discoverers are never started again.
    fn is_released(&self) -> bool {
        false
    }
}

/// Builds the discoverers registered on every start.
pub type DiscovererFactory = Box<dyn Fn() -> Vec<Box<dyn RendererDiscoverer>> + Send + Sync>;

/// Handle given to discoverers to report items.
#[derive(Clone)]
pub struct DiscoverySink {
    registry: RendererRegistry,
}

impl DiscoverySink {
    pub fn item_added(&self, item: RendererItem) {
        self.registry.add_renderer(item);
    }

    pub fn item_removed(&self, id: &str) {
        self.registry.remove_renderer(id);
    }
}

struct RegistryState {
    started: bool,
    renderers: Vec<RendererItem>,
    selected: Option<RendererItem>,
    global_selected: Option<RendererItem>,
    global: bool,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    discoverers: Mutex<Vec<Box<dyn RendererDiscoverer>>>,
    factory: DiscovererFactory,
    bus_producer: Sender<Message>,
    retry_attempts: u32,
    retry_delay: Duration,
}

/// Process-scoped renderer service. Clones share the same registry.
#[derive(Clone)]
pub struct RendererRegistry {
    inner: Arc<RegistryInner>,
}

impl RendererRegistry {
    pub fn new(
        bus_producer: Sender<Message>,
        config: &RendererConfig,
        factory: DiscovererFactory,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    started: false,
                    renderers: Vec::new(),
                    selected: None,
                    global_selected: None,
                    global: true,
                }),
                discoverers: Mutex::new(Vec::new()),
                factory,
                bus_producer,
                retry_attempts: config.discovery_retry_attempts.max(1),
                retry_delay: Duration::from_millis(config.discovery_retry_delay_ms),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn discoverers(&self) -> MutexGuard<'_, Vec<Box<dyn RendererDiscoverer>>> {
        match self.inner.discoverers.lock() {
            Ok(discoverers) => discoverers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, message: RendererMessage) {
        let _ = self.inner.bus_producer.send(Message::Renderer(message));
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Registers and starts the discoverers. No-op when already started.
    pub fn start(&self) {
        {
            let mut state = self.state();
            if state.started {
                return;
            }
            state.started = true;
        }

        let sink = DiscoverySink {
            registry: self.clone(),
        };
        for mut discoverer in (self.inner.factory)() {
            let name = discoverer.name().to_string();
            let result = retry(self.inner.retry_attempts, self.inner.retry_delay, || {
                if discoverer.is_released() {
                    return Err(DiscoveryError::Released { name: name.clone() });
                }
                discoverer.start(sink.clone())
            });
            match result {
                Ok(()) => info!("RendererRegistry: discoverer '{}' started", name),
                Err(err) => warn!("RendererRegistry: giving up on discoverer: {}", err),
            }

            // stop() flips `started` before taking this lock.
            let mut discoverers = self.discoverers();
            if !self.is_started() {
                drop(discoverers);
                debug!("RendererRegistry: stopped while starting '{}'", name);
                discoverer.stop();
                continue;
            }
            discoverers.push(discoverer);
        }
    }

    /// Runs [`start`](Self::start) on a "renderer-discovery" thread.
    pub fn start_in_background(&self) -> io::Result<JoinHandle<()>> {
        self.spawn_discovery(false)
    }

    fn spawn_discovery(&self, reload: bool) -> io::Result<JoinHandle<()>> {
        let registry = self.clone();
        thread::Builder::new()
            .name("renderer-discovery".to_string())
            .spawn(move || {
                registry.start();
                if reload {
                    registry.publish(RendererMessage::Reloaded);
                }
            })
    }

    /// Stops discovery and forgets discovered renderers. No-op when stopped.
    pub fn stop(&self) {
        {
            let mut state = self.state();
            if !state.started {
                return;
            }
            state.started = false;
        }

        {
            let mut discoverers = self.discoverers();
            for discoverer in discoverers.iter_mut() {
                discoverer.stop();
            }
            discoverers.clear();
        }

        let mut state = self.state();
        state.renderers.clear();
        state.selected = None;
        self.publish(RendererMessage::RenderersChanged { empty: true });
        self.publish(RendererMessage::RendererChanged {
            from_user: false,
            renderer: None,
        });
    }

    /// Explicit shutdown of the service.
    pub fn shutdown(&self) {
        self.stop();
    }

    /// Restarts discovery in the background when connectivity returns and
    /// stops it when lost. `Reloaded` follows once discovery is up again.
    pub fn on_network_connection_changed(&self, connected: bool) -> Option<JoinHandle<()>> {
        if !connected {
            self.stop();
            return None;
        }
        match self.spawn_discovery(true) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("RendererRegistry: failed to spawn discovery thread: {}", err);
                None
            }
        }
    }

    pub fn discoverer_count(&self) -> usize {
        self.discoverers().len()
    }

    pub fn add_renderer(&self, item: RendererItem) {
        let mut state = self.state();
        if !state.started {
            debug!("RendererRegistry: ignoring {} reported while stopped", item);
            return;
        }
        if state.renderers.iter().any(|known| known.matches(&item, true)) {
            return;
        }
        debug!("RendererRegistry: added {}", item);
        state.renderers.push(item);
        self.publish(RendererMessage::RenderersChanged { empty: false });
    }

    pub fn remove_renderer(&self, id: &str) {
        let mut state = self.state();
        let Some(position) = state.renderers.iter().position(|known| known.id == id) else {
            return;
        };
        let removed = state.renderers.remove(position);
        debug!("RendererRegistry: removed {}", removed);
        self.publish(RendererMessage::RenderersChanged {
            empty: state.renderers.is_empty(),
        });

        let was_selected = state
            .selected
            .as_ref()
            .is_some_and(|selected| selected.matches(&removed, true));
        if was_selected {
            Self::apply_selection(self, &mut state, false, None, true);
        }
    }

    pub fn renderers(&self) -> Vec<RendererItem> {
        self.state().renderers.clone()
    }

    pub fn find_by_address(&self, address: &str, p2p_device: bool) -> Option<RendererItem> {
        self.state()
            .renderers
            .iter()
            .find(|item| item.address == address && item.is_p2p_device() == p2p_device)
            .cloned()
    }

    /// Selects `item`. A global selection is remembered for
    /// [`restore_renderer`](Self::restore_renderer); a temporary one is not.
    pub fn select_renderer(&self, from_user: bool, item: Option<RendererItem>, global: bool) {
        let mut state = self.state();
        self.apply_selection(&mut state, from_user, item, global);
    }

    fn apply_selection(
        &self,
        state: &mut RegistryState,
        from_user: bool,
        item: Option<RendererItem>,
        global: bool,
    ) {
        state.selected = item.clone();
        state.global = global;
        if global {
            state.global_selected = item.clone();
            debug!(
                "RendererRegistry: global selection from_user={} current={:?}",
                from_user, state.selected
            );
        } else {
            debug!(
                "RendererRegistry: temporary selection from_user={} current={:?} global={:?}",
                from_user, state.selected, state.global_selected
            );
        }
        self.publish(RendererMessage::RendererChanged {
            from_user,
            renderer: item,
        });
    }

    /// Reverts to the global selection, notifying only on an actual change.
    pub fn restore_renderer(&self, from_user: bool) {
        let mut state = self.state();
        let changed = state.selected != state.global_selected;
        debug!(
            "RendererRegistry: restore from_user={} current={:?} global={:?}",
            from_user, state.selected, state.global_selected
        );
        state.selected = state.global_selected.clone();
        state.global = true;
        if changed {
            self.publish(RendererMessage::RendererChanged {
                from_user,
                renderer: state.selected.clone(),
            });
        }
    }

    pub fn has_renderer(&self) -> bool {
        self.state().selected.is_some()
    }

    pub fn selected_renderer(&self) -> Option<RendererItem> {
        self.state().selected.clone()
    }

    pub fn is_global_selection(&self) -> bool {
        self.state().global
    }
}

/// Runs `op` up to `attempts` times with a fixed `delay` between failures.
/// Released discoverers are not retried.
pub fn retry<T>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> Result<T, DiscoveryError>,
) -> Result<T, DiscoveryError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ DiscoveryError::Released { .. }) => return Err(err),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!("retry: attempt {}/{} failed: {}", attempt, attempts, err);
                attempt += 1;
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    struct CountingDiscoverer {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        failures_before_success: usize,
        announce: Vec<RendererItem>,
    }

    impl RendererDiscoverer for CountingDiscoverer {
        fn name(&self) -> &str {
            "counting"
        }

        fn start(&mut self, sink: DiscoverySink) -> Result<(), DiscoveryError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.failures_before_success > 0 {
                self.failures_before_success -= 1;
                return Err(DiscoveryError::StartFailed {
                    name: "counting".to_string(),
                    reason: "transient".to_string(),
                });
            }
            for item in self.announce.drain(..) {
                sink.item_added(item);
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        registry: RendererRegistry,
        receiver: Receiver<Message>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    fn cast(id: &str, address: &str) -> RendererItem {
        RendererItem {
            id: id.to_string(),
            name: format!("TV {id}"),
            kind: RendererKind::Cast,
            address: address.to_string(),
            port: 8009,
            model: String::new(),
        }
    }

    fn p2p_device(id: &str, address: &str, ace_cast: bool) -> RendererItem {
        RendererItem {
            kind: RendererKind::P2pDevice { ace_cast },
            ..cast(id, address)
        }
    }

    fn fixture(failures_before_success: usize, announce: Vec<RendererItem>) -> Fixture {
        fixture_with_delay(failures_before_success, announce, 0)
    }

    fn fixture_with_delay(
        failures_before_success: usize,
        announce: Vec<RendererItem>,
        retry_delay_ms: u64,
    ) -> Fixture {
        let (bus_sender, receiver) = broadcast::channel(256);
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let factory_starts = Arc::clone(&starts);
        let factory_stops = Arc::clone(&stops);
        let config = RendererConfig {
            discovery_retry_attempts: 5,
            discovery_retry_delay_ms: retry_delay_ms,
            ..RendererConfig::default()
        };
        let factory: DiscovererFactory = Box::new(move || {
            vec![Box::new(CountingDiscoverer {
                starts: Arc::clone(&factory_starts),
                stops: Arc::clone(&factory_stops),
                failures_before_success,
                announce: announce.clone(),
            }) as Box<dyn RendererDiscoverer>]
        });
        Fixture {
            registry: RendererRegistry::new(bus_sender, &config, factory),
            receiver,
            starts,
            stops,
        }
    }

    fn drain(receiver: &mut Receiver<Message>) -> Vec<RendererMessage> {
        let mut messages = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(Message::Renderer(message)) => messages.push(message),
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return messages,
            }
        }
    }

    fn renderer_changes(messages: &[RendererMessage]) -> Vec<Option<String>> {
        messages
            .iter()
            .filter_map(|message| match message {
                RendererMessage::RendererChanged { renderer, .. } => {
                    Some(renderer.as_ref().map(|item| item.id.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_twice_registers_discoverers_once() {
        let fixture = fixture(0, Vec::new());
        fixture.registry.start();
        fixture.registry.start();
        assert_eq!(fixture.starts.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.registry.discoverer_count(), 1);

        fixture.registry.stop();
        fixture.registry.stop();
        assert_eq!(fixture.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.registry.discoverer_count(), 0);
    }

    #[test]
    fn test_start_retries_transient_failures() {
        let fixture = fixture(2, vec![cast("tv", "10.0.0.2")]);
        fixture.registry.start();
        assert_eq!(fixture.starts.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.registry.renderers().len(), 1);
    }

    #[test]
    fn test_start_gives_up_after_bounded_attempts() {
        let fixture = fixture(10, Vec::new());
        fixture.registry.start();
        assert_eq!(fixture.starts.load(Ordering::SeqCst), 5);
        assert!(fixture.registry.is_started());
    }

    #[test]
    fn test_added_renderers_are_deduplicated_and_announced() {
        let mut fixture = fixture(0, Vec::new());
        fixture.registry.start();
        fixture.registry.add_renderer(cast("tv", "10.0.0.2"));
        fixture.registry.add_renderer(cast("tv", "10.0.0.2"));
        assert_eq!(fixture.registry.renderers().len(), 1);

        let messages = drain(&mut fixture.receiver);
        let changes = messages
            .iter()
            .filter(|message| matches!(message, RendererMessage::RenderersChanged { empty: false }))
            .count();
        assert_eq!(changes, 1);
    }

    #[test]
    fn test_renderers_reported_while_stopped_are_ignored() {
        let fixture = fixture(0, Vec::new());
        fixture.registry.add_renderer(cast("tv", "10.0.0.2"));
        assert!(fixture.registry.renderers().is_empty());
    }

    #[test]
    fn test_restore_renderer_notifies_only_on_change() {
        let mut fixture = fixture(0, Vec::new());
        let tv = cast("tv", "10.0.0.2");
        let box_device = p2p_device("box", "10.0.0.3", false);

        fixture.registry.select_renderer(true, Some(tv.clone()), true);
        fixture
            .registry
            .select_renderer(false, Some(box_device.clone()), false);
        assert!(!fixture.registry.is_global_selection());

        fixture.registry.restore_renderer(false);
        fixture.registry.restore_renderer(false);

        let changes = renderer_changes(&drain(&mut fixture.receiver));
        assert_eq!(
            changes,
            vec![
                Some("tv".to_string()),
                Some("box".to_string()),
                Some("tv".to_string()),
            ]
        );
        assert_eq!(fixture.registry.selected_renderer(), Some(tv));
        assert!(fixture.registry.is_global_selection());
    }

    #[test]
    fn test_removing_selected_renderer_clears_selection() {
        let mut fixture = fixture(0, Vec::new());
        fixture.registry.start();
        let tv = cast("tv", "10.0.0.2");
        fixture.registry.add_renderer(tv.clone());
        fixture.registry.select_renderer(true, Some(tv), true);
        fixture.registry.remove_renderer("tv");

        assert!(!fixture.registry.has_renderer());
        let messages = drain(&mut fixture.receiver);
        assert_eq!(
            renderer_changes(&messages),
            vec![Some("tv".to_string()), None]
        );
        assert!(messages
            .iter()
            .any(|message| matches!(message, RendererMessage::RenderersChanged { empty: true })));
    }

    #[test]
    fn test_stop_publishes_empty_list_and_cleared_selection() {
        let mut fixture = fixture(0, vec![cast("tv", "10.0.0.2")]);
        fixture.registry.start();
        drain(&mut fixture.receiver);
        fixture.registry.stop();

        let messages = drain(&mut fixture.receiver);
        assert!(matches!(
            messages.as_slice(),
            [
                RendererMessage::RenderersChanged { empty: true },
                RendererMessage::RendererChanged {
                    from_user: false,
                    renderer: None
                }
            ]
        ));
        assert!(fixture.registry.renderers().is_empty());
    }

    #[test]
    fn test_network_reconnect_restarts_discovery_and_reloads() {
        let mut fixture = fixture(0, Vec::new());
        fixture
            .registry
            .on_network_connection_changed(true)
            .expect("discovery thread should spawn")
            .join()
            .expect("discovery thread panicked");
        assert!(fixture.registry.is_started());
        assert!(drain(&mut fixture.receiver)
            .iter()
            .any(|message| matches!(message, RendererMessage::Reloaded)));

        fixture.registry.on_network_connection_changed(false);
        assert!(!fixture.registry.is_started());
    }

    #[test]
    fn test_network_reconnect_retries_off_the_calling_thread() {
        let fixture = fixture_with_delay(10, Vec::new(), 100);
        let begun = Instant::now();
        let handle = fixture
            .registry
            .on_network_connection_changed(true)
            .expect("discovery thread should spawn");
        assert!(begun.elapsed() < Duration::from_millis(300));

        handle.join().expect("discovery thread panicked");
        assert_eq!(fixture.starts.load(Ordering::SeqCst), 5);
        assert!(begun.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_stop_during_start_releases_late_discoverers() {
        let fixture = fixture_with_delay(2, Vec::new(), 50);
        let handle = fixture
            .registry
            .start_in_background()
            .expect("discovery thread should spawn");
        let deadline = Instant::now() + Duration::from_secs(1);
        while !fixture.registry.is_started() {
            assert!(Instant::now() < deadline, "discovery never started");
            thread::sleep(Duration::from_millis(1));
        }
        fixture.registry.stop();

        handle.join().expect("discovery thread panicked");
        assert_eq!(fixture.registry.discoverer_count(), 0);
        assert_eq!(fixture.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_find_by_address_filters_on_kind() {
        let fixture = fixture(0, Vec::new());
        fixture.registry.start();
        fixture.registry.add_renderer(cast("tv", "10.0.0.2"));
        fixture
            .registry
            .add_renderer(p2p_device("box", "10.0.0.2", false));

        assert_eq!(
            fixture
                .registry
                .find_by_address("10.0.0.2", true)
                .map(|item| item.id),
            Some("box".to_string())
        );
        assert_eq!(
            fixture
                .registry
                .find_by_address("10.0.0.2", false)
                .map(|item| item.id),
            Some("tv".to_string())
        );
        assert!(fixture.registry.find_by_address("10.0.0.9", false).is_none());
    }

    #[test]
    fn test_non_strict_match_bridges_cast_and_p2p_device_by_address() {
        let tv = cast("tv", "10.0.0.2");
        let same_box = p2p_device("box", "10.0.0.2", false);
        let ace_cast = p2p_device("ace", "10.0.0.2", true);
        assert!(!tv.matches(&same_box, true));
        assert!(tv.matches(&same_box, false));
        assert!(same_box.matches(&tv, false));
        assert!(!tv.matches(&ace_cast, false));
    }
}
