//! Inbound frame parsing
//!
//! Raw text frames are parsed once into a [`Frame`]; order frames are then
//! split per entry into typed [`ExchangeEvent`]s for the strategy.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::types::Side;
use crate::error::{BotError, BotResult};

/// Order lifecycle entry from the `orders` channel
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    #[serde(default)]
    pub client_oid: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub new_size: Option<Value>,
    #[serde(default)]
    pub side: Option<String>,
}

/// A fill, already routed by side
#[derive(Debug, Clone, PartialEq)]
pub struct FillNotice {
    pub client_oid: String,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelNotice {
    pub client_oid: String,
    pub side: Option<Side>,
    pub price: Option<f64>,
}

/// Typed events emitted by the transport to the strategy
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    PriceUpdate(f64),
    BuyFilled(FillNotice),
    SellFilled(FillNotice),
    OrderCancelled(CancelNotice),
    OrderUpdate(OrderUpdate),
}

/// One parsed inbound frame
#[derive(Debug, Clone)]
pub enum Frame {
    Pong,
    Ping,
    Login { success: bool, code: String, msg: String },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Error { code: String, msg: String },
    Ticker { last_price: f64 },
    Orders(Vec<OrderUpdate>),
    Other,
}

#[derive(Debug, Deserialize)]
struct RawArg {
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<RawArg>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

/// Read a number the exchange may send either as a JSON number or a string
pub fn parse_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn code_string(v: &Option<Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Parse one text frame
pub fn parse_frame(text: &str) -> BotResult<Frame> {
    match text.trim() {
        "pong" => return Ok(Frame::Pong),
        "ping" => return Ok(Frame::Ping),
        _ => {}
    }

    let raw: RawFrame = serde_json::from_str(text)?;

    if let Some(event) = raw.event.as_deref() {
        let channel = raw.arg.as_ref().map(|a| a.channel.clone()).unwrap_or_default();
        return Ok(match event {
            "login" => {
                let code = code_string(&raw.code);
                Frame::Login {
                    success: code == "0",
                    code,
                    msg: raw.msg.unwrap_or_default(),
                }
            }
            "subscribe" => Frame::Subscribed { channel },
            "unsubscribe" => Frame::Unsubscribed { channel },
            "error" => Frame::Error {
                code: code_string(&raw.code),
                msg: raw.msg.unwrap_or_default(),
            },
            _ => Frame::Other,
        });
    }

    let (Some(arg), Some(data)) = (raw.arg, raw.data) else {
        return Ok(Frame::Other);
    };
    if data.is_empty() {
        return Ok(Frame::Other);
    }

    match arg.channel.as_str() {
        "ticker" => {
            let last = data[0].get("lastPr").cloned().unwrap_or(Value::Null);
            match parse_number(&last) {
                Some(price) => Ok(Frame::Ticker { last_price: price }),
                None => Err(BotError::Protocol(format!("invalid ticker price: {}", data[0]))),
            }
        }
        "orders" => {
            let updates = data
                .into_iter()
                .filter_map(|d| match serde_json::from_value::<OrderUpdate>(d) {
                    Ok(u) => Some(u),
                    Err(e) => {
                        warn!("[WS-PRIV] Unparseable order entry dropped: {}", e);
                        None
                    }
                })
                .collect();
            Ok(Frame::Orders(updates))
        }
        _ => Ok(Frame::Other),
    }
}

/// Split order entries into fill / cancel events plus one generic update each
pub fn classify_orders(updates: Vec<OrderUpdate>) -> Vec<ExchangeEvent> {
    let mut events = Vec::with_capacity(updates.len() * 2);

    for update in updates {
        let Some(client_oid) = update.client_oid.clone().filter(|c| !c.is_empty()) else {
            debug!("[WS-PRIV] Order update without clientOid: {:?}", update);
            continue;
        };
        let status = update.status.as_deref().unwrap_or("");
        debug!("[WS-PRIV] Order update {} status={}", client_oid, status);

        match status {
            "filled" => {
                let price = update.price.as_ref().and_then(parse_number);
                let size = update.new_size.as_ref().and_then(parse_number);
                match (price, size) {
                    (Some(price), Some(size)) => {
                        let notice = FillNotice {
                            client_oid: client_oid.clone(),
                            price,
                            size,
                        };
                        match Side::from_client_oid(&client_oid) {
                            Some(Side::Buy) => events.push(ExchangeEvent::BuyFilled(notice)),
                            Some(Side::Sell) => events.push(ExchangeEvent::SellFilled(notice)),
                            None => debug!("[WS-PRIV] Fill for foreign order {}", client_oid),
                        }
                    }
                    _ => warn!(
                        "[WS-PRIV] Fill {} dropped: non-numeric price/size ({:?} / {:?})",
                        client_oid, update.price, update.new_size
                    ),
                }
            }
            "cancelled" | "canceled" => {
                let side = update
                    .side
                    .as_deref()
                    .and_then(Side::parse)
                    .or_else(|| Side::from_client_oid(&client_oid));
                events.push(ExchangeEvent::OrderCancelled(CancelNotice {
                    client_oid: client_oid.clone(),
                    side,
                    price: update.price.as_ref().and_then(parse_number),
                }));
            }
            _ => {}
        }

        events.push(ExchangeEvent::OrderUpdate(update));
    }

    events
}
