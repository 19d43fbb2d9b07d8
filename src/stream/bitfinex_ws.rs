//! Bitfinex WebSocket v2 ticker consumer.
//!
//! One worker task owns the connection: it applies subscription commands,
//! maps `chanId`s back to short symbols, and forwards last-price updates.
//! On disconnect it reconnects with exponential backoff (capped at 60 s);
//! when the attempt budget is spent it emits `ReconnectExhausted` and ends.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{PriceUpdate, StreamEvent, SubscriptionSink};
use crate::domain::Decimal;

const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Handle to the running stream worker.
#[derive(Debug, Clone)]
pub struct BitfinexStream {
    commands: mpsc::Sender<BTreeSet<String>>,
}

impl BitfinexStream {
    /// Spawn the worker; price and lifecycle events land in `events`.
    pub fn spawn(ws_url: String, events: mpsc::Sender<StreamEvent>) -> Self {
        let (commands, command_rx) = mpsc::channel(16);
        tokio::spawn(run_worker(ws_url, command_rx, events));
        Self { commands }
    }
}

#[async_trait]
impl SubscriptionSink for BitfinexStream {
    async fn replace_subscriptions(&self, symbols: BTreeSet<String>) {
        if self.commands.send(symbols).await.is_err() {
            warn!("stream worker gone, subscription update dropped");
        }
    }
}

enum ConnectionExit {
    Disconnected,
    CommandsClosed,
}

async fn run_worker(
    ws_url: String,
    mut commands: mpsc::Receiver<BTreeSet<String>>,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut desired: BTreeSet<String> = BTreeSet::new();
    let mut attempts = 0u32;
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        match connect_async(&ws_url).await {
            Ok((ws, _)) => {
                info!("stream connected to {ws_url}");
                attempts = 0;
                delay = INITIAL_RECONNECT_DELAY;

                match run_connection(ws, &mut desired, &mut commands, &events).await {
                    ConnectionExit::CommandsClosed => return,
                    ConnectionExit::Disconnected => {
                        warn!("stream disconnected");
                    }
                }
            }
            Err(e) => warn!("stream connect failed: {e}"),
        }

        attempts += 1;
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            warn!("stream reconnect budget exhausted, switching to polling only");
            let _ = events.send(StreamEvent::ReconnectExhausted).await;
            return;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn run_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    desired: &mut BTreeSet<String>,
    commands: &mut mpsc::Receiver<BTreeSet<String>>,
    events: &mpsc::Sender<StreamEvent>,
) -> ConnectionExit {
    let (mut sink, mut source) = ws.split();
    let mut channels: HashMap<i64, String> = HashMap::new();
    let mut subscribed: BTreeSet<String> = BTreeSet::new();

    // A fresh connection starts with no live subscriptions; replay the
    // desired set.
    let initial = desired.clone();
    apply_subscription_diff(&mut sink, &mut subscribed, &channels, &initial).await;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(symbols) => {
                        *desired = symbols.clone();
                        apply_subscription_diff(&mut sink, &mut subscribed, &channels, &symbols)
                            .await;
                    }
                    None => return ConnectionExit::CommandsClosed,
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&text, &mut channels, &mut subscribed, events).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return ConnectionExit::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("stream read error: {e}");
                        return ConnectionExit::Disconnected;
                    }
                }
            }
        }
    }
}

async fn apply_subscription_diff(
    sink: &mut WsSink,
    subscribed: &mut BTreeSet<String>,
    channels: &HashMap<i64, String>,
    desired: &BTreeSet<String>,
) {
    let to_drop: Vec<String> = subscribed.difference(desired).cloned().collect();
    let to_add: Vec<String> = desired.difference(subscribed).cloned().collect();

    for symbol in to_drop {
        if let Some((&chan_id, _)) = channels.iter().find(|(_, s)| **s == symbol) {
            let frame = json!({"event": "unsubscribe", "chanId": chan_id});
            if send_frame(sink, frame).await {
                subscribed.remove(&symbol);
            }
        } else {
            // Never confirmed; just forget it.
            subscribed.remove(&symbol);
        }
    }

    for symbol in to_add {
        let frame = json!({
            "event": "subscribe",
            "channel": "ticker",
            "symbol": format!("t{symbol}F0:USTF0"),
        });
        if send_frame(sink, frame).await {
            subscribed.insert(symbol);
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: Value) -> bool {
    match sink.send(Message::Text(frame.to_string().into())).await {
        Ok(()) => true,
        Err(e) => {
            warn!("stream send failed: {e}");
            false
        }
    }
}

async fn handle_text_frame(
    text: &str,
    channels: &mut HashMap<i64, String>,
    subscribed: &mut BTreeSet<String>,
    events: &mpsc::Sender<StreamEvent>,
) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        debug!("unparseable stream frame: {text}");
        return;
    };

    if let Some(event) = value.get("event").and_then(Value::as_str) {
        match event {
            "subscribed" => {
                let chan_id = value.get("chanId").and_then(Value::as_i64);
                let symbol = value
                    .get("symbol")
                    .and_then(Value::as_str)
                    .map(crate::exchange::bitfinex::short_symbol);
                if let (Some(chan_id), Some(symbol)) = (chan_id, symbol) {
                    debug!(chan_id, %symbol, "channel mapped");
                    channels.insert(chan_id, symbol);
                }
            }
            "unsubscribed" => {
                if let Some(chan_id) = value.get("chanId").and_then(Value::as_i64) {
                    if let Some(symbol) = channels.remove(&chan_id) {
                        subscribed.remove(&symbol);
                    }
                }
            }
            "error" => warn!("stream error event: {value}"),
            _ => {}
        }
        return;
    }

    if let Some(update) = parse_ticker_frame(&value, channels) {
        let _ = events.send(StreamEvent::Price(update)).await;
    }
}

/// Extract the last price from a ticker data frame.
///
/// Frames look like `[chanId, [BID, BID_SZ, ASK, ASK_SZ, CHG, CHG_PCT,
/// LAST_PRICE, VOL, HI, LO]]`; heartbeats carry `"hb"` as payload.
fn parse_ticker_frame(
    value: &Value,
    channels: &HashMap<i64, String>,
) -> Option<PriceUpdate> {
    let frame = value.as_array()?;
    let chan_id = frame.first()?.as_i64()?;
    let payload = frame.get(1)?;

    if payload.as_str() == Some("hb") {
        return None;
    }

    let symbol = channels.get(&chan_id)?.clone();
    let last = payload.as_array()?.get(6)?;
    if last.is_null() {
        return None;
    }
    let price = Decimal::parse(&last.to_string()).ok()?;

    Some(PriceUpdate { symbol, price })
}
