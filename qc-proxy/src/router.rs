//! The coordinator task
//!
//! The router owns every piece of mutable proxy state: the state store, the
//! Device API catalog, the subscriptions, the client connections and the
//! device clock. Transports never touch that state directly; they post
//! [`RouterEvent`]s onto one channel and the router drains it together with
//! the store's events and the subscription feed requests.
//!
//! # Device → proxy
//!
//! | Command | Handling |
//! |---|---|
//! | `call proxy message ...` | logged under the `device` target |
//! | `call proxy greeting k=v ...` | resets the device clock, merges device info, broadcast |
//! | `get hwi var` | answered with the stored raw value |
//! | `set hwi var value` | raw-side store update |
//! | `call hwi fn ...` | broadcast to ready clients |
//!
//! In pass-through mode everything but the proxy calls is broadcast verbatim.
//!
//! # Client → proxy
//!
//! Handshakes and heartbeats are always accepted; everything else requires the
//! connection to be `Ready`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use qc_protocol::xml::parse_bool;
use qc_protocol::{
    Command, CommandRegistry, ControlCommand, DeviceCodec, DeviceCommand, DeviceCommandType,
    DeviceInfo, OutgoingPacket, Packet, Subscribe, PROXY_INTERFACE,
};
use qc_state::{
    ApiCatalog, ApiError, FunctionSpec, StateError, StateStore, StoreEvent, Value, VariableKey,
    VariableSpec, POSITIVE_ACK_KEY,
};

use crate::clock::DeviceClock;
use crate::config::ProxyConfig;
use crate::connection::{ClientId, Connection, ConnectionState, Role};
use crate::heartbeat::{self, HeartbeatCounter, Liveness};
use crate::subscription::{FeedRequest, SubscriptionManager};

/// `call proxy message <text...>`
pub const PROXY_MESSAGE: &str = "message";

/// `call proxy greeting <key=value...>`
pub const PROXY_GREETING: &str = "greeting";

/// Most `set` commands put in one feed packet
const FEED_CHUNK: usize = 128;

/// Everything the transports and the binary tell the router
#[derive(Debug)]
pub enum RouterEvent {
    /// A client was accepted; `sender` feeds its writer task
    ClientConnected {
        client: ClientId,
        sender: mpsc::Sender<OutgoingPacket>,
    },
    /// A packet arrived from a client
    ClientPacket { client: ClientId, packet: Packet },
    /// The client closed its connection
    ClientDisconnected { client: ClientId },
    /// Reading from the client failed
    ClientLost { client: ClientId, error: String },
    /// One line arrived from the device
    DeviceLine(String),
    /// The device link closed
    DeviceLost,
    /// Replace the Device API with this document
    ReloadApi(String),
    Shutdown,
}

#[derive(Debug)]
struct ClientHandle {
    connection: Connection,
    sender: mpsc::Sender<OutgoingPacket>,
    liveness: Liveness,
}

impl ClientHandle {
    /// Queue `packet` for the writer; a full queue drops it
    fn push(&self, client: ClientId, packet: OutgoingPacket) {
        match self.sender.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                warn!(%client, commands = packet.len(), "Client queue full, packet dropped");
            }
            Err(TrySendError::Closed(_)) => debug!(%client, "Client writer closed"),
        }
    }
}

pub struct Router {
    proxy_id: String,
    identity: BTreeMap<String, String>,
    default_interval: Duration,
    min_interval: Duration,
    heartbeat_interval: Option<Duration>,
    positive_ack_override: Option<bool>,
    positive_ack: bool,
    pass_through: bool,

    codec: DeviceCodec,
    device_tx: mpsc::UnboundedSender<String>,
    store: StateStore,
    store_rx: mpsc::UnboundedReceiver<StoreEvent>,
    catalog: ApiCatalog,
    device_info: BTreeMap<String, String>,
    subscriptions: SubscriptionManager,
    feed_rx: mpsc::UnboundedReceiver<FeedRequest>,
    registry: Arc<CommandRegistry>,
    heartbeat: HeartbeatCounter,
    clients: BTreeMap<ClientId, ClientHandle>,
    clock: DeviceClock,
}

impl Router {
    /// Build the router around a loaded catalog
    ///
    /// Encoded device lines are sent on `device_tx`. Auto-update timers are
    /// armed when [`Router::run`] starts.
    pub fn new(
        config: &ProxyConfig,
        catalog: ApiCatalog,
        registry: Arc<CommandRegistry>,
        device_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (store, store_rx) = StateStore::new(config.min_auto_update);
        let (subscriptions, feed_rx) = SubscriptionManager::new();

        let mut router = Self {
            proxy_id: config.proxy_id.clone(),
            identity: config.identity(),
            default_interval: config.default_subscription_interval,
            min_interval: config.min_auto_update,
            heartbeat_interval: config.heartbeat_interval,
            positive_ack_override: config.positive_ack,
            positive_ack: false,
            pass_through: config.pass_through,
            codec: DeviceCodec::new(config.separator),
            device_tx,
            store,
            store_rx,
            catalog,
            device_info: BTreeMap::new(),
            subscriptions,
            feed_rx,
            registry,
            heartbeat: HeartbeatCounter::new(),
            clients: BTreeMap::new(),
            clock: DeviceClock::new(config.tick_rate),
        };
        router.apply_catalog();
        router
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn catalog(&self) -> &ApiCatalog {
        &self.catalog
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Catalog device info merged with the latest greeting
    pub fn device_info(&self) -> &BTreeMap<String, String> {
        &self.device_info
    }

    pub fn client_state(&self, client: ClientId) -> Option<ConnectionState> {
        self.clients.get(&client).map(|handle| handle.connection.state())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    /// Whether client sets go straight to the device and wait for its echo
    pub fn positive_ack(&self) -> bool {
        self.positive_ack
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Drain events until `Shutdown` or until every event sender is gone
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
        self.arm_auto_updates();
        let mut heartbeat = self.heartbeat_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(
            variables = self.store.len(),
            pass_through = self.pass_through,
            positive_ack = self.positive_ack,
            "Router started"
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if !self.handle_event(event) {
                            break;
                        }
                    }
                    None => {
                        info!("Router event channel closed");
                        break;
                    }
                },
                Some(event) = self.store_rx.recv() => self.handle_store_event(event),
                Some(request) = self.feed_rx.recv() => self.handle_feed(&request),
                _ = next_tick(&mut heartbeat) => self.send_heartbeats(),
            }
        }

        self.shutdown();
        info!("Router stopped");
    }

    /// Apply one event; returns `false` on shutdown
    pub fn handle_event(&mut self, event: RouterEvent) -> bool {
        match event {
            RouterEvent::ClientConnected { client, sender } => self.add_client(client, sender),
            RouterEvent::ClientPacket { client, packet } => self.handle_client_packet(client, packet),
            RouterEvent::ClientDisconnected { client } => {
                self.remove_client(client, Connection::disconnect)
            }
            RouterEvent::ClientLost { client, error } => {
                warn!(%client, %error, "Client connection lost");
                self.remove_client(client, Connection::lose)
            }
            RouterEvent::DeviceLine(line) => self.handle_device_line(&line),
            RouterEvent::DeviceLost => warn!("Device link lost"),
            RouterEvent::ReloadApi(document) => {
                if let Err(e) = self.reload_api(&document) {
                    warn!(error = %e, "Device API reload failed, keeping the current API");
                }
            }
            RouterEvent::Shutdown => return false,
        }
        true
    }

    /// Stop every timer and drop every client
    pub fn shutdown(&mut self) {
        self.subscriptions.clear();
        self.store.reset();
        for (client, handle) in self.clients.iter_mut() {
            handle.connection.disconnect();
            debug!(%client, "Client dropped at shutdown");
        }
        self.clients.clear();
    }

    // ========================================================================
    // Device API
    // ========================================================================

    /// Replace store and catalog with a new Device API and push it to clients
    ///
    /// Subscriptions survive the reload. Returns the number of variables loaded.
    pub fn reload_api(&mut self, document: &str) -> Result<usize, ApiError> {
        let catalog = ApiCatalog::parse(document)?;
        self.catalog = catalog;
        let loaded = self.apply_catalog();
        self.arm_auto_updates();

        let api = self.catalog.device_api();
        self.broadcast(&Command::from(api));
        Ok(loaded)
    }

    fn apply_catalog(&mut self) -> usize {
        self.codec.set_interfaces(self.catalog.interface_names());
        let loaded = self.store.load(self.catalog.variables.iter().cloned());
        self.device_info = self.catalog.device_info.clone();
        self.refresh_positive_ack();
        info!(
            variables = loaded,
            interfaces = self.catalog.interfaces.len(),
            functions = self.catalog.functions.len(),
            "Device API loaded"
        );
        loaded
    }

    fn arm_auto_updates(&mut self) {
        if self.pass_through {
            return;
        }
        let armed = self.store.arm_auto_updates();
        debug!(armed, "Auto-updates armed");
    }

    fn refresh_positive_ack(&mut self) {
        self.positive_ack = self
            .positive_ack_override
            .or_else(|| self.device_info.get(POSITIVE_ACK_KEY).and_then(|value| parse_bool(value)))
            .unwrap_or(false);
    }

    // ========================================================================
    // Device side
    // ========================================================================

    pub fn handle_device_line(&mut self, line: &str) {
        trace!(line, "From device");
        if let Some(command) = self.codec.decode_line(line) {
            self.handle_device_command(command, Utc::now());
        }
    }

    /// Apply a command received from the device at `now`
    pub fn handle_device_command(&mut self, command: DeviceCommand, now: DateTime<Utc>) {
        if command.hw_interface == PROXY_INTERFACE {
            self.handle_proxy_call(command, now);
            return;
        }

        let timestamp = self.clock.timestamp(command.timestamp, now);
        if self.pass_through {
            self.broadcast(&Command::Device(command));
            return;
        }

        let key = VariableKey::new(command.hw_interface.clone(), command.variable.clone());
        match command.kind {
            DeviceCommandType::Get => match self.store.raw_value(&key) {
                Some(raw) => {
                    let reply = DeviceCommand::set(key.hw_interface.clone(), key.name.clone(), raw.to_string());
                    self.send_to_device(&reply);
                }
                None if self.store.contains(&key) => {
                    debug!(variable = %key, "Device asked for a variable without a value");
                }
                None => warn!(variable = %key, "Device asked for an unknown variable"),
            },
            DeviceCommandType::Set => {
                let Some(text) = command.value() else {
                    return;
                };
                match self.store.update_from_device(&key, Value::from(text), timestamp) {
                    Ok(changed) => trace!(variable = %key, changed, "Device value applied"),
                    Err(StateError::UnknownVariable(_)) => {
                        warn!(variable = %key, "Device set for an unknown variable ignored");
                    }
                    Err(e) => warn!(variable = %key, error = %e, "Device value rejected"),
                }
            }
            DeviceCommandType::Call => self.broadcast(&Command::Device(command)),
        }
    }

    fn handle_proxy_call(&mut self, command: DeviceCommand, now: DateTime<Utc>) {
        if command.kind != DeviceCommandType::Call {
            warn!(command = command.name(), "Only calls may address the proxy interface");
            return;
        }

        match command.variable.as_str() {
            PROXY_MESSAGE => {
                let time = self.clock.timestamp(command.timestamp, now);
                info!(target: "device", %time, "{}", command.args.join(" "));
            }
            PROXY_GREETING => {
                if let Some(ticks) = command.timestamp {
                    self.clock.reset(ticks, now);
                }
                for argument in &command.args {
                    match argument.split_once('=') {
                        Some((key, value)) => {
                            self.device_info.insert(key.to_string(), value.to_string());
                        }
                        None => debug!(argument = %argument, "Greeting argument without '=' ignored"),
                    }
                }
                self.refresh_positive_ack();
                info!(info = ?self.device_info, "Device greeting");
                self.broadcast(&Command::Device(command));
            }
            other => warn!(function = other, "Unknown proxy call"),
        }
    }

    // ========================================================================
    // Client side
    // ========================================================================

    fn add_client(&mut self, client: ClientId, sender: mpsc::Sender<OutgoingPacket>) {
        let mut connection = Connection::new(Role::Server, self.identity.clone());
        connection.connect();
        info!(%client, "Client connected");
        self.clients.insert(
            client,
            ClientHandle {
                connection,
                sender,
                liveness: Liveness::default(),
            },
        );
    }

    fn remove_client(&mut self, client: ClientId, terminate: fn(&mut Connection) -> bool) {
        if let Some(mut handle) = self.clients.remove(&client) {
            terminate(&mut handle.connection);
            info!(%client, state = %handle.connection.state(), "Client removed");
        }
        self.subscriptions.cancel_client(client);
    }

    /// Handle every command of a client packet and send one reply packet
    pub fn handle_client_packet(&mut self, client: ClientId, packet: Packet) {
        if !self.clients.contains_key(&client) {
            warn!(%client, packet = %packet.id, "Packet from an unknown client dropped");
            return;
        }

        let mut replies = Vec::new();
        for command in packet.commands {
            self.handle_client_command(client, command, &mut replies);
        }
        if !replies.is_empty() {
            self.send_to_client(client, OutgoingPacket::reply(&packet.id, replies));
        }
    }

    fn handle_client_command(&mut self, client: ClientId, command: Command, replies: &mut Vec<Command>) {
        let Some(handle) = self.clients.get_mut(&client) else {
            return;
        };

        match &command {
            Command::Control(ControlCommand::HandShake(handshake)) => {
                let was_ready = handle.connection.is_ready();
                if let Some(reply) = handle.connection.on_handshake(handshake) {
                    replies.push(reply.into());
                }
                if !was_ready && handle.connection.is_ready() {
                    info!(%client, peer = ?handle.connection.peer_id(), "Client ready");
                }
                return;
            }
            Command::Control(ControlCommand::HeartBeat(beat)) => {
                match heartbeat::reply_to(beat) {
                    Some(reply) => replies.push(reply.into()),
                    None => {
                        if !handle.liveness.record_reply(beat) {
                            debug!(%client, ack = beat.ack, "Stale heartbeat reply");
                        }
                    }
                }
                return;
            }
            _ if !handle.connection.is_ready() => {
                warn!(
                    %client,
                    command = command.name(),
                    state = %handle.connection.state(),
                    "Command from a client that is not ready dropped"
                );
                return;
            }
            _ => {}
        }

        match command {
            Command::Control(control) => self.handle_client_control(client, control, replies),
            Command::Device(device) => self.handle_client_device(client, device, replies),
            Command::Extension(extension) => {
                debug!(%client, command = extension.name(), "No handler for extension command");
            }
        }
    }

    fn handle_client_control(&mut self, client: ClientId, control: ControlCommand, replies: &mut Vec<Command>) {
        match control {
            ControlCommand::Subscribe(request) => self.subscribe(client, &request),
            ControlCommand::Unsubscribe(request) => {
                self.subscriptions
                    .unsubscribe(client, &request.hw_interface, &request.variable);
            }
            ControlCommand::ReqDeviceApi => replies.push(self.catalog.device_api().into()),
            ControlCommand::ReqDeviceInfo => {
                replies.push(DeviceInfo::new(self.device_info.clone()).into());
            }
            other => warn!(%client, command = other.name(), "Unexpected control command from client"),
        }
    }

    fn subscribe(&mut self, client: ClientId, request: &Subscribe) {
        if !request.hw_interface.is_empty() && !self.codec.knows_interface(&request.hw_interface) {
            warn!(%client, hw_interface = %request.hw_interface, "Subscription to unknown hardware interface refused");
            return;
        }
        let interval = self.subscription_interval(request);
        self.subscriptions
            .subscribe(client, interval, &request.hw_interface, &request.variable);
    }

    /// Requested interval, else the variable's user-side autoUpdate, else the
    /// default; never below the auto-update minimum
    fn subscription_interval(&self, request: &Subscribe) -> Duration {
        let requested = if request.interval_ms > 0 {
            Duration::from_millis(request.interval_ms)
        } else if !request.variable.is_empty() {
            self.catalog
                .variable(&VariableKey::new(&request.hw_interface, &request.variable))
                .and_then(VariableSpec::user_push_interval)
                .unwrap_or(self.default_interval)
        } else {
            self.default_interval
        };
        requested.max(self.min_interval)
    }

    fn handle_client_device(&mut self, client: ClientId, command: DeviceCommand, replies: &mut Vec<Command>) {
        if command.hw_interface == PROXY_INTERFACE || !self.codec.knows_interface(&command.hw_interface) {
            warn!(%client, hw_interface = %command.hw_interface, "Device command for unknown hardware interface dropped");
            return;
        }

        if self.pass_through {
            self.send_to_device(&command);
            return;
        }

        let key = VariableKey::new(command.hw_interface.clone(), command.variable.clone());
        match command.kind {
            DeviceCommandType::Get => self.answer_get(client, &key, replies),
            DeviceCommandType::Set => self.client_set(client, &key, &command),
            DeviceCommandType::Call => self.client_call(client, &command),
        }
    }

    fn answer_get(&self, client: ClientId, key: &VariableKey, replies: &mut Vec<Command>) {
        let Some(variable) = self.store.get(key) else {
            warn!(%client, variable = %key, "Get for an unknown variable");
            return;
        };
        if !variable.access().can_read() {
            warn!(%client, variable = %key, access = %variable.access(), "Get refused");
            return;
        }
        match variable.user_value() {
            Some(value) => replies.push(
                DeviceCommand::set(key.hw_interface.clone(), key.name.clone(), value.to_string()).into(),
            ),
            None => debug!(%client, variable = %key, "Get for a variable without a value"),
        }
    }

    fn client_set(&mut self, client: ClientId, key: &VariableKey, command: &DeviceCommand) {
        let Some(text) = command.value() else {
            return;
        };
        let user = Value::from(text);

        if self.positive_ack {
            // The device echoes accepted sets; the store follows the echo
            match self.store.convert_to_raw(key, user) {
                Ok(raw) => {
                    let set = DeviceCommand::set(key.hw_interface.clone(), key.name.clone(), raw.to_string());
                    self.send_to_device(&set);
                }
                Err(e) => warn!(%client, variable = %key, error = %e, "Set refused"),
            }
            return;
        }

        match self.store.set_value(key, user) {
            Ok(true) => trace!(%client, variable = %key, "Set applied"),
            Ok(false) => debug!(%client, variable = %key, "Set without change, nothing sent"),
            Err(e) => warn!(%client, variable = %key, error = %e, "Set refused"),
        }
    }

    fn client_call(&self, client: ClientId, command: &DeviceCommand) {
        if let Some(function) = self.catalog.function(&command.hw_interface, &command.variable) {
            if let Err(reason) = check_arguments(function, &command.args) {
                warn!(%client, function = %command.variable, %reason, "Call refused");
                return;
            }
        }
        self.send_to_device(command);
    }

    // ========================================================================
    // Store events, feeds and heartbeats
    // ========================================================================

    pub fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::SendToDevice { key, raw } => {
                self.send_to_device(&DeviceCommand::set(key.hw_interface, key.name, raw.to_string()));
            }
            StoreEvent::UpdateRequested { key } => {
                self.send_to_device(&DeviceCommand::get(key.hw_interface, key.name));
            }
            StoreEvent::Updated {
                key,
                raw,
                user,
                timestamp,
            } => trace!(variable = %key, %raw, ?user, %timestamp, "Variable updated"),
        }
    }

    /// Push the subscription's current values to its client
    ///
    /// Variables a narrower subscription of the same client covers are left
    /// to that subscription.
    pub fn handle_feed(&mut self, request: &FeedRequest) {
        if self.pass_through {
            return;
        }
        let Some(subscription) =
            self.subscriptions
                .get(request.client, &request.hw_interface, &request.variable)
        else {
            trace!(client = %request.client, "Feed for a removed subscription");
            return;
        };
        let ready = self
            .clients
            .get(&request.client)
            .is_some_and(|handle| handle.connection.is_ready());
        if !ready {
            return;
        }

        let commands: Vec<Command> = self
            .store
            .snapshot()
            .filter(|(key, _)| {
                subscription.covers(key)
                    && !self
                        .subscriptions
                        .more_specific_subscription_exists(key, subscription)
            })
            .map(|(key, value)| {
                DeviceCommand::set(key.hw_interface.clone(), key.name.clone(), value.to_string()).into()
            })
            .collect();

        for packet in OutgoingPacket::pack(&self.proxy_id, commands, FEED_CHUNK) {
            self.send_to_client(request.client, packet);
        }
    }

    /// Send the next heartbeat to every ready client
    pub fn send_heartbeats(&mut self) {
        for (client, handle) in self.clients.iter_mut() {
            if !handle.connection.is_ready() {
                continue;
            }
            let beat = self.heartbeat.next_heartbeat();
            if !handle.liveness.record_sent(beat.id) {
                debug!(%client, "Client did not answer the previous heartbeat");
            }
            handle.push(*client, OutgoingPacket::single(beat));
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn send_to_device(&self, command: &DeviceCommand) {
        match self.codec.encode(command) {
            Ok(line) => {
                trace!(line = line.trim_end(), "To device");
                if self.device_tx.send(line).is_err() {
                    warn!(command = command.name(), "Device link closed, command dropped");
                }
            }
            Err(e) => warn!(error = %e, "Device command cannot be encoded"),
        }
    }

    fn send_to_client(&self, client: ClientId, packet: OutgoingPacket) {
        if let Some(handle) = self.clients.get(&client) {
            handle.push(client, packet);
        }
    }

    fn broadcast(&self, command: &Command) {
        for (client, handle) in &self.clients {
            if !handle.connection.is_ready() {
                continue;
            }
            handle.push(*client, OutgoingPacket::single(command.clone()));
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("variables", &self.store.len())
            .field("clients", &self.clients.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("pass_through", &self.pass_through)
            .field("positive_ack", &self.positive_ack)
            .finish()
    }
}

/// Argument count and types of a declared function
fn check_arguments(function: &FunctionSpec, args: &[String]) -> Result<(), String> {
    if function.arguments.len() != args.len() {
        return Err(format!(
            "expected {} arguments, got {}",
            function.arguments.len(),
            args.len()
        ));
    }
    for (argument, text) in function.arguments.iter().zip(args) {
        Value::parse(argument.value_type, text)
            .map_err(|e| format!("argument {}: {e}", argument.name))?;
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_protocol::{HandShake, HeartBeat, PacketId, Unsubscribe};
    use rstest::rstest;

    const API: &str = r#"
        <deviceAPI>
          <deviceInfo><name>Bench board</name></deviceInfo>
          <hardwareInterfaceList>
            <hardwareInterface name="hwiLed"/>
            <hardwareInterface name="hwiTemp"/>
          </hardwareInterfaceList>
          <stateVariableList>
            <stateVariable name="led1" hwInterface="hwiLed">
              <type><device>int</device><user>bool</user></type>
              <conversion>
                <toUser>value != 0</toUser>
                <toDevice>value ? 1 : 0</toDevice>
              </conversion>
            </stateVariable>
            <stateVariable name="t0" hwInterface="hwiTemp" access="read">
              <type><device>int</device><user>double</user></type>
              <conversion><toUser>value / 10</toUser></conversion>
            </stateVariable>
            <stateVariable name="t1" hwInterface="hwiTemp" access="read">
              <type>int</type>
              <autoUpdate side="user">300</autoUpdate>
            </stateVariable>
            <stateVariable name="setpoint" hwInterface="hwiTemp" access="write">
              <type>double</type>
            </stateVariable>
          </stateVariableList>
          <functionList>
            <function name="blink" hwInterface="hwiLed">
              <argument name="count" type="uint"/>
            </function>
          </functionList>
        </deviceAPI>"#;

    const GUI: ClientId = ClientId(1);

    struct Harness {
        router: Router,
        device_rx: mpsc::UnboundedReceiver<String>,
        client_rx: mpsc::Receiver<OutgoingPacket>,
        sequence: u64,
    }

    impl Harness {
        fn new(config: ProxyConfig) -> Self {
            Self::with_api(config, API, 1024)
        }

        fn with_api(config: ProxyConfig, api: &str, queue_len: usize) -> Self {
            let catalog = ApiCatalog::parse(api).unwrap();
            let (device_tx, device_rx) = mpsc::unbounded_channel();
            let registry = Arc::new(CommandRegistry::with_builtins());
            let mut router = Router::new(&config, catalog, registry, device_tx);

            let (sender, client_rx) = mpsc::channel(queue_len);
            router.handle_event(RouterEvent::ClientConnected { client: GUI, sender });
            Self {
                router,
                device_rx,
                client_rx,
                sequence: 0,
            }
        }

        fn ready(config: ProxyConfig) -> Self {
            Self::handshake(Self::new(config))
        }

        fn handshake(mut harness: Self) -> Self {
            let identity = BTreeMap::from([("id".to_string(), "gui".to_string())]);
            harness.send(vec![HandShake::with_info(identity).into()]);
            harness.send(vec![HandShake::ack().into()]);
            assert_eq!(harness.router.client_state(GUI), Some(ConnectionState::Ready));
            harness.drain_client();
            harness
        }

        fn send(&mut self, commands: Vec<Command>) {
            self.sequence += 1;
            let packet = Packet {
                id: PacketId::new("gui", self.sequence),
                reply_to: None,
                commands,
            };
            self.router.handle_event(RouterEvent::ClientPacket { client: GUI, packet });
            self.pump_store();
        }

        fn device(&mut self, line: &str) {
            self.router.handle_event(RouterEvent::DeviceLine(line.to_string()));
            self.pump_store();
        }

        fn pump_store(&mut self) {
            while let Ok(event) = self.router.store_rx.try_recv() {
                self.router.handle_store_event(event);
            }
        }

        fn device_lines(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(line) = self.device_rx.try_recv() {
                lines.push(line);
            }
            lines
        }

        fn drain_client(&mut self) -> Vec<OutgoingPacket> {
            let mut packets = Vec::new();
            while let Ok(packet) = self.client_rx.try_recv() {
                packets.push(packet);
            }
            packets
        }

        fn feed(&mut self, hw_interface: &str, variable: &str) -> Vec<Command> {
            self.router.handle_feed(&FeedRequest {
                client: GUI,
                hw_interface: hw_interface.to_string(),
                variable: variable.to_string(),
            });
            self.drain_client()
                .into_iter()
                .flat_map(|packet| packet.commands)
                .collect()
        }
    }

    fn set(hw_interface: &str, variable: &str, value: &str) -> Command {
        DeviceCommand::set(hw_interface, variable, value).into()
    }

    // ========================================================================
    // Connection handling
    // ========================================================================

    #[tokio::test]
    async fn test_handshake_reply_and_ready() {
        let mut harness = Harness::new(ProxyConfig::default());
        let identity = BTreeMap::from([("id".to_string(), "gui".to_string())]);
        harness.send(vec![HandShake::with_info(identity).into()]);

        let packets = harness.drain_client();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].reply_to, Some(PacketId::new("gui", 1)));
        match &packets[0].commands[0] {
            Command::Control(ControlCommand::HandShake(reply)) => {
                assert!(reply.ack);
                assert_eq!(reply.id(), Some("qcProxy"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(harness.router.client_state(GUI), Some(ConnectionState::HandShaking));

        harness.send(vec![HandShake::ack().into()]);
        assert_eq!(harness.router.client_state(GUI), Some(ConnectionState::Ready));
    }

    #[tokio::test]
    async fn test_commands_before_ready_are_dropped() {
        let mut harness = Harness::new(ProxyConfig::default());
        harness.send(vec![
            set("hwiLed", "led1", "true"),
            ControlCommand::ReqDeviceInfo.into(),
        ]);
        assert!(harness.drain_client().is_empty());
        assert!(harness.device_lines().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_answered_before_ready() {
        let mut harness = Harness::new(ProxyConfig::default());
        harness.send(vec![HeartBeat::new(4).into()]);

        let packets = harness.drain_client();
        assert_eq!(packets[0].commands, vec![Command::from(HeartBeat::new(4).to_reply())]);
    }

    #[tokio::test]
    async fn test_heartbeats_go_to_ready_clients() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.router.send_heartbeats();
        harness.router.send_heartbeats();

        let ids: Vec<u64> = harness
            .drain_client()
            .into_iter()
            .flat_map(|packet| packet.commands)
            .filter_map(|command| match command {
                Command::Control(ControlCommand::HeartBeat(beat)) => Some(beat.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_subscriptions() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![Subscribe::new("hwiTemp", "", 100).into()]);
        assert_eq!(harness.router.subscriptions().len(), 1);

        harness.router.handle_event(RouterEvent::ClientDisconnected { client: GUI });
        harness.router.handle_event(RouterEvent::ClientDisconnected { client: GUI });
        assert!(harness.router.subscriptions().is_empty());
        assert_eq!(harness.router.client_count(), 0);
    }

    // ========================================================================
    // Requests
    // ========================================================================

    #[tokio::test]
    async fn test_api_and_info_requests() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![
            ControlCommand::ReqDeviceApi.into(),
            ControlCommand::ReqDeviceInfo.into(),
        ]);

        let packets = harness.drain_client();
        assert_eq!(packets.len(), 1);
        let names: Vec<&str> = packets[0].commands.iter().map(Command::name).collect();
        assert_eq!(names, vec!["deviceAPI", "deviceInfo"]);
        match &packets[0].commands[1] {
            Command::Control(ControlCommand::DeviceInfo(info)) => {
                assert_eq!(info.info.get("name").map(String::as_str), Some("Bench board"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    // ========================================================================
    // Values
    // ========================================================================

    #[tokio::test]
    async fn test_device_set_then_client_get() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("set hwiTemp t0 215");
        assert_eq!(
            harness.router.store().user_value(&VariableKey::new("hwiTemp", "t0")),
            Some(&Value::Double(21.5))
        );

        harness.send(vec![DeviceCommand::get("hwiTemp", "t0").into()]);
        let packets = harness.drain_client();
        assert_eq!(packets[0].commands, vec![set("hwiTemp", "t0", "21.5")]);
    }

    #[tokio::test]
    async fn test_device_get_answered_with_raw() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("set hwiTemp t0 215");
        harness.device("get hwiTemp t0");
        assert_eq!(harness.device_lines(), vec!["set hwiTemp t0 215\n".to_string()]);
    }

    #[tokio::test]
    async fn test_client_set_is_converted_for_device() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![set("hwiLed", "led1", "true")]);
        assert_eq!(harness.device_lines(), vec!["set hwiLed led1 1\n".to_string()]);

        // Same value again is not a change
        harness.send(vec![set("hwiLed", "led1", "true")]);
        assert!(harness.device_lines().is_empty());
    }

    #[rstest]
    #[case::read_only("hwiTemp", "t0", "1")]
    #[case::unknown_variable("hwiTemp", "t9", "1")]
    #[case::bad_value("hwiTemp", "setpoint", "warm")]
    #[tokio::test]
    async fn test_client_set_refused(#[case] hw_interface: &str, #[case] variable: &str, #[case] value: &str) {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![set(hw_interface, variable, value)]);
        assert!(harness.device_lines().is_empty());
    }

    #[tokio::test]
    async fn test_positive_ack_waits_for_device_echo() {
        let config = ProxyConfig {
            positive_ack: Some(true),
            ..Default::default()
        };
        let mut harness = Harness::ready(config);
        let led = VariableKey::new("hwiLed", "led1");

        harness.send(vec![set("hwiLed", "led1", "true")]);
        assert_eq!(harness.device_lines(), vec!["set hwiLed led1 1\n".to_string()]);
        assert_eq!(harness.router.store().user_value(&led), None);

        harness.device("set hwiLed led1 1");
        assert_eq!(harness.router.store().user_value(&led), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_call_checks_declared_arguments() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![DeviceCommand::call("hwiLed", "blink", ["3"]).into()]);
        harness.send(vec![DeviceCommand::call("hwiLed", "blink", ["-1"]).into()]);
        harness.send(vec![DeviceCommand::call("hwiLed", "blink", Vec::<String>::new()).into()]);
        harness.send(vec![DeviceCommand::call("hwiLed", "undeclared", ["x"]).into()]);

        assert_eq!(
            harness.device_lines(),
            vec!["call hwiLed blink 3\n".to_string(), "call hwiLed undeclared x\n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_interface_dropped() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![DeviceCommand::get("hwiMotor", "speed").into()]);
        assert!(harness.drain_client().is_empty());
        assert!(harness.device_lines().is_empty());
    }

    // ========================================================================
    // Device calls
    // ========================================================================

    #[tokio::test]
    async fn test_device_call_is_broadcast() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("call hwiLed blinked 3");

        let packets = harness.drain_client();
        assert_eq!(
            packets[0].commands,
            vec![Command::from(DeviceCommand::call("hwiLed", "blinked", ["3"]))]
        );
    }

    #[tokio::test]
    async fn test_greeting_merges_device_info() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("call @1f4 proxy greeting version=1.4 positiveAck=true");

        assert_eq!(
            harness.router.device_info().get("version").map(String::as_str),
            Some("1.4")
        );
        assert!(harness.router.positive_ack());
        assert_eq!(harness.router.clock.reference().map(|(ticks, _)| ticks), Some(0x1f4));
        assert_eq!(harness.drain_client().len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_message_is_not_forwarded() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("call proxy message booting \"stage 2\"");
        assert!(harness.drain_client().is_empty());
        assert!(harness.device_lines().is_empty());
    }

    // ========================================================================
    // Pass-through
    // ========================================================================

    #[tokio::test]
    async fn test_pass_through_relays_verbatim() {
        let mut harness = Harness::ready(ProxyConfig::pass_through());
        harness.device("set hwiTemp t0 215");
        assert!(harness.router.store().user_value(&VariableKey::new("hwiTemp", "t0")).is_none());
        assert_eq!(
            harness.drain_client()[0].commands,
            vec![set("hwiTemp", "t0", "215")]
        );

        harness.send(vec![set("hwiTemp", "t0", "7")]);
        assert_eq!(harness.device_lines(), vec!["set hwiTemp t0 7\n".to_string()]);
    }

    #[tokio::test]
    async fn test_pass_through_feeds_send_nothing() {
        let mut harness = Harness::ready(ProxyConfig::pass_through());
        harness.send(vec![Subscribe::new("", "", 100).into()]);
        assert!(harness.feed("", "").is_empty());
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    #[tokio::test]
    async fn test_feed_specificity() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("set hwiTemp t0 215");
        harness.device("set hwiTemp t1 7");
        harness.send(vec![
            Subscribe::new("hwiTemp", "", 100).into(),
            Subscribe::new("hwiTemp", "t0", 100).into(),
        ]);

        assert_eq!(harness.feed("hwiTemp", ""), vec![set("hwiTemp", "t1", "7")]);
        assert_eq!(harness.feed("hwiTemp", "t0"), vec![set("hwiTemp", "t0", "21.5")]);
    }

    fn display_api(lines: usize) -> String {
        let variables: String = (0..lines)
            .map(|i| format!(r#"<stateVariable name="line{i}" hwInterface="hwiLcd"><type>string</type></stateVariable>"#))
            .collect();
        format!(
            r#"<deviceAPI>
                 <hardwareInterfaceList><hardwareInterface name="hwiLcd"/></hardwareInterfaceList>
                 <stateVariableList>{variables}</stateVariableList>
               </deviceAPI>"#
        )
    }

    #[tokio::test]
    async fn test_feed_of_large_values_fits_packets() {
        let api = display_api(130);
        let mut harness = Harness::handshake(Harness::with_api(ProxyConfig::default(), &api, 1024));
        let text = "x".repeat(600);
        for i in 0..130 {
            harness.device(&format!("set hwiLcd line{i} {text}"));
        }
        harness.send(vec![Subscribe::new("hwiLcd", "", 100).into()]);
        harness.drain_client();

        harness.router.handle_feed(&FeedRequest {
            client: GUI,
            hw_interface: "hwiLcd".to_string(),
            variable: String::new(),
        });
        let packets = harness.drain_client();
        assert!(packets.len() > 1);

        let mut codec = qc_protocol::PacketCodec::new("qcProxy", harness.router.registry().clone());
        let mut fed = std::collections::BTreeSet::new();
        for packet in &packets {
            assert!(codec.encode_payload(packet).is_ok());
            for command in &packet.commands {
                let Command::Device(device) = command else {
                    panic!("unexpected command {command:?}");
                };
                assert_eq!(device.args, vec![text.clone()]);
                fed.insert(device.variable.clone());
            }
        }
        assert_eq!(fed.len(), 130);
    }

    #[tokio::test]
    async fn test_full_client_queue_drops_packets() {
        let mut harness = Harness::handshake(Harness::with_api(ProxyConfig::default(), API, 4));
        for i in 0..10 {
            harness.device(&format!("call hwiLed blinked {i}"));
        }

        let packets = harness.drain_client();
        assert_eq!(packets.len(), 4);
        assert_eq!(
            packets[0].commands,
            vec![Command::from(DeviceCommand::call("hwiLed", "blinked", ["0"]))]
        );

        // Room again once the writer has caught up
        harness.device("call hwiLed blinked 10");
        assert_eq!(harness.drain_client().len(), 1);
    }

    #[tokio::test]
    async fn test_feed_skips_unreadable_and_empty() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![set("hwiTemp", "setpoint", "20.5")]);
        harness.send(vec![Subscribe::new("*", "*", 100).into()]);

        // setpoint is write-only, nothing else has a value yet
        assert!(harness.feed("", "").is_empty());
    }

    #[tokio::test]
    async fn test_subscription_intervals() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![
            Subscribe::new("hwiTemp", "t1", 0).into(),
            Subscribe::new("hwiTemp", "t0", 0).into(),
            Subscribe::new("hwiLed", "", 1).into(),
        ]);

        let interval = |hw_interface, variable| {
            harness
                .router
                .subscriptions()
                .get(GUI, hw_interface, variable)
                .map(|subscription| subscription.interval)
        };
        assert_eq!(interval("hwiTemp", "t1"), Some(Duration::from_millis(300)));
        assert_eq!(interval("hwiTemp", "t0"), Some(Duration::from_secs(1)));
        assert_eq!(interval("hwiLed", ""), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![
            Subscribe::new("hwiTemp", "", 100).into(),
            Subscribe::new("hwiLed", "led1", 100).into(),
        ]);
        harness.send(vec![Unsubscribe::all().into()]);
        assert!(harness.router.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_interface_refused() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.send(vec![Subscribe::new("hwiMotor", "", 100).into()]);
        assert!(harness.router.subscriptions().is_empty());
    }

    // ========================================================================
    // Reload
    // ========================================================================

    #[tokio::test]
    async fn test_reload_api_pushes_new_document() {
        let mut harness = Harness::ready(ProxyConfig::default());
        harness.device("set hwiTemp t0 215");

        let reloaded = API.replace("Bench board", "Bench board v2");
        harness.router.handle_event(RouterEvent::ReloadApi(reloaded));

        assert_eq!(
            harness.router.store().user_value(&VariableKey::new("hwiTemp", "t0")),
            None
        );
        assert_eq!(
            harness.router.device_info().get("name").map(String::as_str),
            Some("Bench board v2")
        );
        let packets = harness.drain_client();
        assert_eq!(packets[0].commands[0].name(), "deviceAPI");
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_api() {
        let mut harness = Harness::ready(ProxyConfig::default());
        assert!(harness.router.reload_api("<deviceAPI/>").is_err());
        assert_eq!(harness.router.store().len(), 4);
        assert!(harness.drain_client().is_empty());
    }
}
