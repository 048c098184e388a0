use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::*;
use mqtt::topic_name::TopicNameError;
use mqtt::{Encodable, QualityOfService, TopicFilter, TopicName};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::errors::Error;
use crate::message::{EventMessage, MethodId, MethodInvocation};
use crate::session::{
    ConfirmationCallback, ConfirmationResult, DeviceSession, MethodCallback, PolledSession,
    SendEventError, Session, SessionOption,
};
use crate::token::{ConnectionString, TokenSource};

// Incoming topic names
const METHOD_POST_TOPIC_FILTER: &str = "$iothub/methods/POST/#";
const METHOD_POST_TOPIC_PREFIX: &str = "$iothub/methods/POST/";
const REQUEST_ID_PARAM: &str = "?$rid=";

// Outgoing topic names
fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, request_id)
}

fn cloud_bound_messages_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

const MQTT_PORT: u16 = 8883;
const KEEP_ALIVE: u16 = 10;
const API_VERSION: &str = "2018-06-30";
/// How long a pump waits for the first inbound packet
const POLL_TIMEOUT: Duration = Duration::from_millis(1);
/// Upper bound for TCP connect, TLS handshake and CONNACK together
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

type Stream = TlsStream<TcpStream>;

async fn tcp_connect(iot_hub: &str, port: u16, trusted_certs: Option<&str>) -> crate::Result<Stream> {
    let socket = TcpStream::connect((iot_hub, port)).await?;

    trace!("Connected to tcp socket {:?}", socket);

    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    if let Some(bundle) = trusted_certs {
        for pem in pem_certificates(bundle) {
            builder.add_root_certificate(native_tls::Certificate::from_pem(pem.as_bytes())?);
        }
    }
    let cx = TlsConnector::from(builder.build()?);

    let socket = cx.connect(iot_hub, socket).await?;

    trace!("Connected tls context {:?}", cx);

    Ok(socket)
}

async fn mqtt_connect(
    iot_hub: &str,
    port: u16,
    device_id: &str,
    username: String,
    password: String,
    trusted_certs: Option<&str>,
) -> crate::Result<Stream> {
    let mut socket = tcp_connect(iot_hub, port, trusted_certs).await?;

    let mut conn = ConnectPacket::new(device_id);
    conn.set_client_identifier(device_id);
    conn.set_clean_session(false);
    conn.set_keep_alive(KEEP_ALIVE);
    conn.set_user_name(Some(username));
    conn.set_password(Some(password));

    socket.write_all(&encode(conn)?).await?;

    let packet = VariablePacket::parse(&mut socket).await;

    trace!("PACKET {:?}", packet);
    match packet {
        Ok(VariablePacket::ConnackPacket(connack)) => {
            if connack.connect_return_code() != ConnectReturnCode::ConnectionAccepted {
                return Err(Error::Connection(format!(
                    "server refused connection, return code {:?}",
                    connack.connect_return_code()
                )));
            }
        }
        Ok(pck) => {
            return Err(Error::Connection(format!(
                "unexpected packet received after connect {:?}",
                pck
            )))
        }
        Err(err) => {
            return Err(Error::Connection(format!(
                "error decoding connack packet {:?}",
                err
            )))
        }
    }

    Ok(socket)
}

fn encode(packet: impl Into<VariablePacket>) -> crate::Result<Vec<u8>> {
    let packet: VariablePacket = packet.into();
    let mut buf = Vec::new();
    packet
        .encode(&mut buf)
        .map_err(|err| Error::Connection(format!("failed to encode {:?}: {:?}", packet, err)))?;
    Ok(buf)
}

/// Individual certificates of a PEM bundle
fn pem_certificates(bundle: &str) -> impl Iterator<Item = &str> {
    bundle
        .split_inclusive(PEM_END)
        .filter(|block| block.contains(PEM_BEGIN))
        .map(|block| &block[block.find(PEM_BEGIN).unwrap_or(0)..])
}

/// Split `{method name}/?$rid={request id}` out of a method invocation topic
fn parse_method_topic(topic: &str) -> Option<(&str, &str)> {
    let details = topic.strip_prefix(METHOD_POST_TOPIC_PREFIX)?;
    let (method_name, params) = details.split_once('/')?;
    let request_id = params.strip_prefix(REQUEST_ID_PARAM)?;
    if method_name.is_empty() || request_id.is_empty() {
        return None;
    }
    Some((method_name, request_id))
}

fn build_topic_name(base_topic: &str, message: &EventMessage) -> Result<TopicName, TopicNameError> {
    // Ordered so the topic is stable for a given message
    let mut props = std::collections::BTreeMap::new();
    props.extend(message.system_properties.iter());
    props.extend(message.properties.iter());

    // if we reuse the base_topic string as the target for the serializer,
    // we end up with an extra ampersand before the key/value pairs
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(props.iter())
        .finish();
    TopicName::new(format!("{}{}", base_topic, encoded))
}

#[derive(Debug)]
enum Inbound {
    Publish { topic: String, payload: Vec<u8> },
    Puback(u16),
    Pingresp,
    Closed(String),
}

async fn read_loop(mut reader: ReadHalf<Stream>, tx: UnboundedSender<Inbound>) {
    loop {
        let packet = match VariablePacket::parse(&mut reader).await {
            Ok(packet) => packet,
            Err(err) => {
                let _ = tx.send(Inbound::Closed(format!("{:?}", err)));
                break;
            }
        };

        let inbound = match packet {
            VariablePacket::PublishPacket(ref publ) => Inbound::Publish {
                topic: publ.topic_name().to_string(),
                payload: publ.payload_ref()[..].to_vec(),
            },
            VariablePacket::PubackPacket(ref ack) => Inbound::Puback(ack.packet_identifier()),
            VariablePacket::PingrespPacket(..) => Inbound::Pingresp,
            _ => continue,
        };

        if tx.send(inbound).is_err() {
            // Session dropped
            break;
        }
    }
}

struct PendingEvent {
    message: EventMessage,
    on_confirm: ConfirmationCallback,
}

impl PendingEvent {
    fn complete(self, result: ConfirmationResult) {
        (self.on_confirm)(result, self.message)
    }
}

enum Outbound {
    Subscribe,
    Event(PendingEvent),
    MethodResponse {
        request_id: String,
        status: i32,
        body: Vec<u8>,
    },
}

struct Link {
    writer: WriteHalf<Stream>,
    inbound: UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
    last_write: Instant,
}

enum LinkState {
    /// Not yet connected; the first pump connects
    Idle,
    Connected(Link),
    /// Connection failed or was lost. Not retried.
    Failed,
}

/// Polled device session to IoT Hub over MQTT
///
/// Nothing happens on the network unless [`PolledSession::do_work`] is called. Method handlers
/// and confirmation callbacks run inside `do_work` on the calling thread. The session drives its
/// own single threaded tokio runtime, so it must not be pumped or dropped from within an async
/// context.
pub struct MqttSession {
    hostname: String,
    port: u16,
    connect_timeout: Duration,
    device_id: String,
    d2c_topic: String,
    token_source: Box<dyn TokenSource + Send>,
    log_trace: bool,
    trusted_certs: Option<String>,
    runtime: Runtime,
    state: LinkState,
    outbound: VecDeque<Outbound>,
    unacked: HashMap<u16, PendingEvent>,
    next_packet_id: u16,
    callback: Option<MethodCallback>,
}

impl fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            LinkState::Idle => "idle",
            LinkState::Connected(_) => "connected",
            LinkState::Failed => "failed",
        };
        f.debug_struct("MqttSession")
            .field("hostname", &self.hostname)
            .field("device_id", &self.device_id)
            .field("state", &state)
            .field("queued", &self.outbound.len())
            .field("unacked", &self.unacked.len())
            .field("callback", &self.callback)
            .finish()
    }
}

impl MqttSession {
    /// Create a session from `HostName=...;DeviceId=...;SharedAccessKey=...`
    /// (or `SharedAccessSignature=...`). Does not connect.
    pub fn from_connection_string(connection_string: &str) -> crate::Result<Self> {
        let connection_string = ConnectionString::parse(connection_string)?;
        let token_source = connection_string.token_source()?;
        Self::new(
            connection_string.hostname,
            connection_string.device_id,
            token_source,
        )
    }

    /// Create a session authenticating with `token_source`. Does not connect.
    pub fn new(
        hostname: String,
        device_id: String,
        token_source: Box<dyn TokenSource + Send>,
    ) -> crate::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            d2c_topic: cloud_bound_messages_topic(&device_id),
            hostname,
            port: MQTT_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            device_id,
            token_source,
            log_trace: false,
            trusted_certs: None,
            runtime,
            state: LinkState::Idle,
            outbound: VecDeque::new(),
            unacked: HashMap::new(),
            next_packet_id: 0,
            callback: None,
        })
    }

    fn connect(&mut self) {
        let user_name = format!(
            "{}/{}/?api-version={}",
            self.hostname, self.device_id, API_VERSION
        );

        let expiry = Utc::now() + chrono::Duration::days(1);
        trace!("Generating token that will expire at {}", expiry);
        let token = self.token_source.get(&expiry);

        let connect = mqtt_connect(
            &self.hostname,
            self.port,
            &self.device_id,
            user_name,
            token,
            self.trusted_certs.as_deref(),
        );
        let result = match self
            .runtime
            .block_on(async { tokio::time::timeout(self.connect_timeout, connect).await })
        {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "no connection after {:?}",
                self.connect_timeout
            ))),
        };

        match result {
            Ok(socket) => {
                info!("Connected to {} as {}", self.hostname, self.device_id);
                let (read_socket, write_socket) = tokio::io::split(socket);
                let (tx, rx) = unbounded_channel();
                let reader = self.runtime.spawn(read_loop(read_socket, tx));
                self.state = LinkState::Connected(Link {
                    writer: write_socket,
                    inbound: rx,
                    reader,
                    last_write: Instant::now(),
                });
                if self.callback.is_some() {
                    self.outbound.push_front(Outbound::Subscribe);
                }
            }
            Err(err) => {
                error!("Failed to connect to {}: {}", self.hostname, err);
                self.state = LinkState::Failed;
            }
        }
    }

    fn packet_id(&mut self) -> Option<u16> {
        // Zero is not a valid packet identifier, and ids awaiting PUBACK are still taken
        for _ in 0..u16::MAX {
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            if !self.unacked.contains_key(&self.next_packet_id) {
                return Some(self.next_packet_id);
            }
        }
        None
    }

    fn write(&mut self, buf: &[u8]) -> crate::Result<()> {
        let link = match &mut self.state {
            LinkState::Connected(link) => link,
            _ => return Err(Error::NotConnected),
        };
        self.runtime.block_on(link.writer.write_all(buf))?;
        link.last_write = Instant::now();
        Ok(())
    }

    fn send_packet(&mut self, packet: impl Into<VariablePacket>) -> crate::Result<()> {
        let packet = packet.into();
        if self.log_trace {
            debug!("Sending PACKET {:?}", packet);
        }
        let buf = encode(packet)?;
        self.write(&buf)
    }

    fn flush_outbound(&mut self) {
        if !matches!(self.state, LinkState::Connected(_)) {
            return;
        }

        while let Some(item) = self.outbound.pop_front() {
            let result = match item {
                Outbound::Subscribe => self.subscribe(),
                Outbound::Event(pending) => self.publish_event(pending),
                Outbound::MethodResponse {
                    request_id,
                    status,
                    body,
                } => {
                    trace!("Responding to direct method with rid = {}", request_id);
                    TopicName::new(method_response_topic(status, &request_id))
                        .map_err(|err| Error::Connection(format!("{:?}", err)))
                        .and_then(|topic| {
                            self.send_packet(PublishPacket::new(
                                topic,
                                QoSWithPacketIdentifier::Level0,
                                body,
                            ))
                        })
                }
            };

            if let Err(err) = result {
                self.link_failed(&err.to_string());
                return;
            }
        }
    }

    fn subscribe(&mut self) -> crate::Result<()> {
        let filter = TopicFilter::new(METHOD_POST_TOPIC_FILTER)
            .map_err(|err| Error::Connection(format!("{:?}", err)))?;
        let topics = vec![(filter, QualityOfService::Level0)];

        trace!("Subscribing to {:?}", topics);

        let packet_id = self
            .packet_id()
            .ok_or_else(|| Error::Connection("no free packet identifier".to_owned()))?;
        self.send_packet(SubscribePacket::new(packet_id, topics))
    }

    fn publish_event(&mut self, pending: PendingEvent) -> crate::Result<()> {
        let topic = match build_topic_name(&self.d2c_topic, &pending.message) {
            Ok(topic) => topic,
            Err(err) => {
                error!("Message properties do not form a valid topic: {:?}", err);
                pending.complete(ConfirmationResult::Error);
                return Ok(());
            }
        };

        let packet_id = match self.packet_id() {
            Some(packet_id) => packet_id,
            None => {
                error!("Every packet identifier is awaiting PUBACK");
                pending.complete(ConfirmationResult::Error);
                return Ok(());
            }
        };
        trace!("Sending message {} to topic {:?}", packet_id, topic);
        let packet = PublishPacket::new(
            topic,
            QoSWithPacketIdentifier::Level1(packet_id),
            pending.message.body.clone(),
        );
        // Tracked before writing so a failed write confirms it with the rest
        self.unacked.insert(packet_id, pending);
        self.send_packet(packet)
    }

    fn keep_alive(&mut self) {
        let idle = match &self.state {
            LinkState::Connected(link) => link.last_write.elapsed(),
            _ => return,
        };
        if idle >= Duration::from_secs(u64::from(KEEP_ALIVE) / 2) {
            trace!("Sending PINGREQ to broker");
            if let Err(err) = self.send_packet(PingreqPacket::new()) {
                self.link_failed(&err.to_string());
            }
        }
    }

    fn poll_inbound(&mut self) -> Vec<Inbound> {
        let link = match &mut self.state {
            LinkState::Connected(link) => link,
            _ => return Vec::new(),
        };

        let mut received = Vec::new();
        match self
            .runtime
            .block_on(async { tokio::time::timeout(POLL_TIMEOUT, link.inbound.recv()).await })
        {
            Ok(Some(first)) => received.push(first),
            Ok(None) => received.push(Inbound::Closed("receive loop ended".to_owned())),
            Err(_) => return received,
        }
        while let Ok(next) = link.inbound.try_recv() {
            received.push(next);
        }
        received
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Puback(packet_id) => match self.unacked.remove(&packet_id) {
                Some(pending) => pending.complete(ConfirmationResult::Ok),
                None => warn!("PUBACK for unknown packet {}", packet_id),
            },
            Inbound::Pingresp => trace!("Receiving PINGRESP from broker .."),
            Inbound::Closed(reason) => self.link_failed(&reason),
            Inbound::Publish { topic, payload } => match parse_method_topic(&topic) {
                Some((method_name, request_id)) => {
                    let invocation =
                        MethodInvocation::new(method_name, payload, MethodId::new(request_id));
                    match self.callback.take() {
                        Some(mut callback) => {
                            callback.dispatch(self, invocation);
                            self.callback = Some(callback);
                        }
                        None => warn!("No method handler for {}", invocation.method_name),
                    }
                }
                None => debug!("Ignoring publish on {}", topic),
            },
        }
    }

    fn link_failed(&mut self, reason: &str) {
        error!("Connection to {} lost: {}", self.hostname, reason);
        if let LinkState::Connected(link) = &self.state {
            link.reader.abort();
        }
        self.state = LinkState::Failed;
        self.fail_pending(ConfirmationResult::Error);
    }

    /// Complete every outstanding send with `result`
    fn fail_pending(&mut self, result: ConfirmationResult) {
        let mut unacked: Vec<_> = self.unacked.drain().collect();
        unacked.sort_by_key(|(packet_id, _)| *packet_id);
        for (_, pending) in unacked {
            pending.complete(result);
        }

        for item in self.outbound.drain(..) {
            match item {
                Outbound::Event(pending) => pending.complete(result),
                Outbound::MethodResponse { request_id, .. } => {
                    warn!("Dropping response for method request {}", request_id)
                }
                Outbound::Subscribe => {}
            }
        }
    }
}

impl DeviceSession for MqttSession {
    fn send_event_async(
        &mut self,
        message: EventMessage,
        on_confirm: ConfirmationCallback,
    ) -> Result<(), SendEventError> {
        if let LinkState::Failed = self.state {
            return Err(SendEventError {
                message,
                reason: "session is not connected".to_owned(),
            });
        }
        self.outbound
            .push_back(Outbound::Event(PendingEvent { message, on_confirm }));
        Ok(())
    }

    fn respond_to_method(
        &mut self,
        method_id: MethodId,
        body: &[u8],
        status: i32,
    ) -> crate::Result<()> {
        if let LinkState::Failed = self.state {
            return Err(Error::NotConnected);
        }
        self.outbound.push_back(Outbound::MethodResponse {
            request_id: method_id.as_str().to_owned(),
            status,
            body: body.to_vec(),
        });
        Ok(())
    }
}

impl Session for MqttSession {
    fn set_option(&mut self, option: SessionOption) -> crate::Result<()> {
        let name = option.name();
        match option {
            SessionOption::LogTrace(on) => self.log_trace = on,
            SessionOption::TrustedCerts(bundle) => {
                if !matches!(self.state, LinkState::Idle) {
                    return Err(Error::Option {
                        name,
                        reason: "connection already attempted".to_owned(),
                    });
                }
                let mut count = 0;
                for pem in pem_certificates(&bundle) {
                    native_tls::Certificate::from_pem(pem.as_bytes())?;
                    count += 1;
                }
                if count == 0 {
                    return Err(Error::Option {
                        name,
                        reason: "no certificates found".to_owned(),
                    });
                }
                self.trusted_certs = Some(bundle);
            }
        }
        Ok(())
    }

    fn register_method_handler(&mut self, callback: MethodCallback) -> crate::Result<()> {
        if let LinkState::Failed = self.state {
            return Err(Error::NotConnected);
        }
        let subscribe = self.callback.is_none() && matches!(self.state, LinkState::Connected(_));
        self.callback = Some(callback);
        if subscribe {
            self.outbound.push_back(Outbound::Subscribe);
        }
        Ok(())
    }
}

impl PolledSession for MqttSession {
    fn do_work(&mut self) {
        if let LinkState::Idle = self.state {
            self.connect();
        }

        self.flush_outbound();
        self.keep_alive();

        for inbound in self.poll_inbound() {
            if self.log_trace {
                debug!("Received {:?}", inbound);
            }
            self.handle_inbound(inbound);
        }

        // Responses queued by handlers above
        self.flush_outbound();

        if let LinkState::Failed = self.state {
            self.fail_pending(ConfirmationResult::Error);
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.fail_pending(ConfirmationResult::BecauseDestroy);
        if let LinkState::Connected(link) = &mut self.state {
            if let Ok(buf) = encode(DisconnectPacket::new()) {
                let _ = self.runtime.block_on(link.writer.write_all(&buf));
            }
            link.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{AsyncResponseHandler, RunFlag, STATUS_SUCCESS, SUCCESS_RESPONSE};
    use crate::token::SasTokenSource;
    use std::sync::{Arc, Mutex};

    type Confirmations = Arc<Mutex<Vec<(ConfirmationResult, Vec<u8>)>>>;

    fn recorder(confirmations: &Confirmations) -> ConfirmationCallback {
        let sink = confirmations.clone();
        Box::new(move |result, message: EventMessage| {
            sink.lock().unwrap().push((result, message.body))
        })
    }

    fn pending(text: &str, confirmations: &Confirmations) -> PendingEvent {
        PendingEvent {
            message: EventMessage::from_text(text).unwrap(),
            on_confirm: recorder(confirmations),
        }
    }

    fn session() -> MqttSession {
        MqttSession::new(
            "myhub.azure-devices.net".to_owned(),
            "device".to_owned(),
            Box::new(SasTokenSource::new("sas")),
        )
        .unwrap()
    }

    #[test]
    fn content_type_is_appended_to_topic_name() {
        let message = EventMessage::builder()
            .set_body(b"x".to_vec())
            .set_content_type("application/json".to_owned())
            .build()
            .unwrap();

        let topic_with_properties = build_topic_name("topic/", &message).unwrap().to_string();

        assert_eq!("topic/%24.ct=application%2Fjson", topic_with_properties);
    }

    #[test]
    fn message_id_is_appended_to_topic_name() {
        let message = EventMessage::builder()
            .set_body(b"x".to_vec())
            .set_message_id("id".to_owned())
            .build()
            .unwrap();

        let topic_with_properties = build_topic_name("topic/", &message).unwrap().to_string();

        assert_eq!("topic/%24.mid=id", topic_with_properties);
    }

    #[test]
    fn no_properties_keeps_base_topic() {
        let message = EventMessage::from_text("x").unwrap();
        let actual = build_topic_name("topic/", &message).unwrap();
        assert_eq!(TopicName::new("topic/").unwrap(), actual);
    }

    #[test]
    fn app_properties_are_appended_to_topic_name() {
        let message = EventMessage::builder()
            .set_body(b"x".to_vec())
            .add_message_property("foo".to_owned(), "bar".to_owned())
            .build()
            .unwrap();

        let topic_with_properties = build_topic_name("topic/", &message).unwrap().to_string();

        assert_eq!("topic/foo=bar", topic_with_properties);
    }

    #[test]
    fn method_topic_is_split_into_name_and_request_id() {
        assert_eq!(
            parse_method_topic("$iothub/methods/POST/reboot/?$rid=1"),
            Some(("reboot", "1"))
        );
        assert_eq!(parse_method_topic("$iothub/methods/POST/reboot/"), None);
        assert_eq!(parse_method_topic("$iothub/twin/res/200/?$rid=1"), None);
    }

    #[test]
    fn response_topic_carries_status_and_request_id() {
        assert_eq!(
            method_response_topic(304, "abc"),
            "$iothub/methods/res/304/?$rid=abc"
        );
    }

    #[test]
    fn pem_bundle_is_split_per_certificate() {
        let bundle = "junk\n-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n\
                      -----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        let certs: Vec<_> = pem_certificates(bundle).collect();
        assert_eq!(certs.len(), 2);
        assert!(certs[0].starts_with(PEM_BEGIN));
        assert!(certs[1].contains("BBB"));
    }

    #[test]
    fn destroy_confirms_queued_events() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut session = session();
        let sink = results.clone();
        session
            .send_event_async(
                EventMessage::from_text("hello").unwrap(),
                Box::new(move |result, message| sink.lock().unwrap().push((result, message))),
            )
            .unwrap();

        drop(session);

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, ConfirmationResult::BecauseDestroy);
        assert_eq!(results[0].1.body, b"hello");
    }

    #[test]
    fn empty_certificate_bundle_is_rejected() {
        let mut session = session();
        assert!(session
            .set_option(SessionOption::TrustedCerts("no certs here".to_owned()))
            .is_err());
        assert!(session.set_option(SessionOption::LogTrace(true)).is_ok());
    }

    #[test]
    fn method_post_is_dispatched_and_answered_with_its_request_id() {
        let run = RunFlag::new();
        let mut session = session();
        session
            .register_method_handler(MethodCallback::ExplicitResponse(Box::new(
                AsyncResponseHandler::new(run.clone()),
            )))
            .unwrap();

        session.handle_inbound(Inbound::Publish {
            topic: "$iothub/methods/POST/reboot/?$rid=42".to_owned(),
            payload: b"{}".to_vec(),
        });

        assert!(!run.is_running());
        assert_eq!(session.outbound.len(), 2);
        assert!(matches!(session.outbound[0], Outbound::Event(_)));
        match &session.outbound[1] {
            Outbound::MethodResponse {
                request_id,
                status,
                body,
            } => {
                assert_eq!(request_id, "42");
                assert_eq!(*status, STATUS_SUCCESS);
                assert_eq!(body, SUCCESS_RESPONSE.as_bytes());
            }
            _ => panic!("expected a method response"),
        }
    }

    #[test]
    fn publish_outside_method_topics_is_ignored() {
        let run = RunFlag::new();
        let mut session = session();
        session
            .register_method_handler(MethodCallback::ExplicitResponse(Box::new(
                AsyncResponseHandler::new(run.clone()),
            )))
            .unwrap();

        session.handle_inbound(Inbound::Publish {
            topic: "devices/device/messages/devicebound/".to_owned(),
            payload: b"{}".to_vec(),
        });

        assert!(run.is_running());
        assert!(session.outbound.is_empty());
    }

    #[test]
    fn puback_confirms_event_exactly_once() {
        let confirmations = Confirmations::default();
        let mut session = session();
        session.unacked.insert(5, pending("hello", &confirmations));

        session.handle_inbound(Inbound::Puback(5));
        session.handle_inbound(Inbound::Puback(5));

        let confirmations = confirmations.lock().unwrap();
        assert_eq!(
            *confirmations,
            vec![(ConfirmationResult::Ok, b"hello".to_vec())]
        );
        assert!(session.unacked.is_empty());
    }

    #[test]
    fn lost_connection_fails_queued_and_unacked_events() {
        let confirmations = Confirmations::default();
        let mut session = session();
        session.unacked.insert(1, pending("sent", &confirmations));
        session
            .send_event_async(
                EventMessage::from_text("queued").unwrap(),
                recorder(&confirmations),
            )
            .unwrap();

        session.handle_inbound(Inbound::Closed("reset by peer".to_owned()));

        assert!(matches!(session.state, LinkState::Failed));
        assert!(session.unacked.is_empty());
        assert!(session.outbound.is_empty());
        let confirmations = confirmations.lock().unwrap();
        assert_eq!(
            *confirmations,
            vec![
                (ConfirmationResult::Error, b"sent".to_vec()),
                (ConfirmationResult::Error, b"queued".to_vec()),
            ]
        );
    }

    #[test]
    fn failed_session_rejects_sends_and_responses() {
        let confirmations = Confirmations::default();
        let mut session = session();
        session.state = LinkState::Failed;

        let err = session
            .send_event_async(
                EventMessage::from_text("late").unwrap(),
                recorder(&confirmations),
            )
            .unwrap_err();
        assert_eq!(err.message.body, b"late");

        assert!(matches!(
            session.respond_to_method(MethodId::new("7"), b"{}", STATUS_SUCCESS),
            Err(Error::NotConnected)
        ));
        assert!(session.outbound.is_empty());

        drop(session);
        assert!(confirmations.lock().unwrap().is_empty());
    }

    #[test]
    fn packet_ids_wrap_past_ids_awaiting_puback() {
        let confirmations = Confirmations::default();
        let mut session = session();
        session.next_packet_id = u16::MAX;
        session.unacked.insert(1, pending("in flight", &confirmations));

        assert_eq!(session.packet_id(), Some(2));
        assert_eq!(session.packet_id(), Some(3));
    }

    #[test]
    fn silent_server_fails_the_connect_after_the_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            // Accept and never answer the TLS handshake
            let (_socket, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(2));
        });

        let mut session = MqttSession::new(
            "127.0.0.1".to_owned(),
            "device".to_owned(),
            Box::new(SasTokenSource::new("sas")),
        )
        .unwrap();
        session.port = port;
        session.connect_timeout = Duration::from_millis(200);

        let started = Instant::now();
        session.do_work();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(session.state, LinkState::Failed));
        assert!(session
            .send_event_async(
                EventMessage::from_text("late").unwrap(),
                Box::new(|_, _| {})
            )
            .is_err());

        server.join().unwrap();
    }
}
