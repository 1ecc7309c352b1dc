//! rumqttc-backed broker transport
//!
//! `AsyncClient` becomes the session client and `EventLoop` the session driver. The
//! event loop reconnects on the next `poll` after an error, which is exactly the
//! contract the connection manager's supervisor expects.

use super::transport::{
    BoxFuture, BrokerTransport, DriverEvent, QoS, SessionClient, SessionDriver, SessionOptions,
    TransportError,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS as RumqttQoS, Transport,
};
use std::sync::Arc;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttTransport;

fn to_rumqtt_qos(qos: QoS) -> RumqttQoS {
    match qos {
        QoS::AtMostOnce => RumqttQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttQoS::ExactlyOnce,
    }
}

impl RumqttTransport {
    fn mqtt_options(options: &SessionOptions) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.address.host.clone(),
            options.address.port,
        );
        mqtt_options
            .set_credentials(options.username.clone(), options.password.clone())
            .set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session);

        if options.address.tls {
            mqtt_options.set_transport(Transport::Tls(Default::default()));
            info!("TLS enabled for {}", options.address.host);
        }

        mqtt_options
    }
}

impl BrokerTransport for RumqttTransport {
    fn open(
        &self,
        options: &SessionOptions,
    ) -> Result<(Arc<dyn SessionClient>, Box<dyn SessionDriver>), TransportError> {
        if options.keep_alive.as_secs() < 1 && !options.keep_alive.is_zero() {
            return Err(TransportError::Options(format!(
                "keep alive {:?} is below one second",
                options.keep_alive
            )));
        }

        let mqtt_options = Self::mqtt_options(options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.request_capacity.max(1));
        debug!("Created rumqttc client for {}", options.address);

        Ok((
            Arc::new(RumqttClient { client }),
            Box::new(RumqttDriver { event_loop }),
        ))
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

struct RumqttClient {
    client: AsyncClient,
}

impl SessionClient for RumqttClient {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.client
                .publish(topic, to_rumqtt_qos(qos), false, payload)
                .await
                .map_err(|e| TransportError::Request(e.to_string()))
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        // Nobody may be polling the event loop anymore, so never wait on the channel
        Box::pin(async move {
            self.client
                .try_disconnect()
                .map_err(|e| TransportError::Request(e.to_string()))
        })
    }
}

struct RumqttDriver {
    event_loop: EventLoop,
}

impl SessionDriver for RumqttDriver {
    fn poll(&mut self) -> BoxFuture<'_, Result<DriverEvent, TransportError>> {
        Box::pin(async move {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        debug!("CONNACK received, session present: {}", ack.session_present);
                        Ok(DriverEvent::Connected)
                    } else {
                        Err(TransportError::Refused(format!("{:?}", ack.code)))
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => Ok(DriverEvent::Closed),
                Ok(event) => {
                    trace!("MQTT event: {:?}", event);
                    Ok(DriverEvent::Activity)
                }
                Err(ConnectionError::ConnectionRefused(code)) => {
                    Err(TransportError::Refused(format!("{:?}", code)))
                }
                Err(e) => Err(TransportError::Dropped(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddress;
    use std::time::Duration;

    fn options(uri: &str) -> SessionOptions {
        SessionOptions {
            address: ServerAddress::parse(uri).unwrap(),
            client_id: "lux-1".into(),
            username: "user".into(),
            password: "pass".into(),
            keep_alive: Duration::from_secs(30),
            clean_session: false,
            request_capacity: 10,
        }
    }

    #[test]
    fn maps_session_options() {
        let mqtt_options = RumqttTransport::mqtt_options(&options("tcp://broker.local:1884"));
        assert_eq!(
            mqtt_options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(mqtt_options.client_id(), "lux-1");
        assert!(!mqtt_options.clean_session());
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            mqtt_options.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn maps_qos_levels() {
        assert_eq!(to_rumqtt_qos(QoS::AtMostOnce), RumqttQoS::AtMostOnce);
        assert_eq!(to_rumqtt_qos(QoS::AtLeastOnce), RumqttQoS::AtLeastOnce);
        assert_eq!(to_rumqtt_qos(QoS::ExactlyOnce), RumqttQoS::ExactlyOnce);
    }
}
