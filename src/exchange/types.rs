//! Bitget exchange types
//!
//! Order side, client identifiers, and the outbound wire payloads
//! (subscribe / unsubscribe / trade).

use serde::{Deserialize, Serialize};

// ======================= ORDER SIDE =======================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    /// Recover the side from a client identifier's prefix
    pub fn from_client_oid(client_oid: &str) -> Option<Side> {
        if client_oid.starts_with("buy_") {
            Some(Side::Buy)
        } else if client_oid.starts_with("sell_") {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ======================= CLIENT IDS =======================

fn now_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn short_random(len: usize) -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(len);
    s
}

/// `{side}_{ms}_{random}` - the side prefix is what inbound order events are
/// routed on, so it must stay first
pub fn new_client_oid(side: Side) -> String {
    format!("{}_{}_{}", side.as_str(), now_ms(), short_random(8))
}

fn new_request_id(prefix: &str) -> String {
    format!("{}-{}", prefix, short_random(12))
}

// ======================= SUBSCRIPTIONS =======================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionArg {
    pub inst_type: String,
    pub channel: String,
    pub inst_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionMessage {
    pub op: &'static str,
    pub args: Vec<SubscriptionArg>,
}

impl SubscriptionMessage {
    pub fn subscribe(arg: SubscriptionArg) -> Self {
        Self { op: "subscribe", args: vec![arg] }
    }

    pub fn unsubscribe(arg: SubscriptionArg) -> Self {
        Self { op: "unsubscribe", args: vec![arg] }
    }
}

// ======================= TRADE =======================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderParams {
    pub order_type: &'static str,
    pub side: Side,
    pub size: String,
    pub price: String,
    pub force: &'static str,
    pub client_oid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderParams {
    pub client_oid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TradeParams {
    Place(PlaceOrderParams),
    Cancel(CancelOrderParams),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeArg {
    pub id: String,
    pub inst_type: String,
    pub inst_id: String,
    pub channel: &'static str,
    pub params: TradeParams,
}

/// `op: trade` frame carrying a single place or cancel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeMessage {
    pub op: &'static str,
    pub args: Vec<TradeArg>,
}

impl TradeMessage {
    /// Post-only limit order; price and size are pre-formatted to precision
    pub fn place(
        inst_type: &str,
        inst_id: &str,
        side: Side,
        price: String,
        size: String,
        client_oid: String,
    ) -> Self {
        Self {
            op: "trade",
            args: vec![TradeArg {
                id: new_request_id("trade"),
                inst_type: inst_type.to_string(),
                inst_id: inst_id.to_string(),
                channel: "place-order",
                params: TradeParams::Place(PlaceOrderParams {
                    order_type: "limit",
                    side,
                    size,
                    price,
                    force: "post_only",
                    client_oid,
                }),
            }],
        }
    }

    pub fn cancel(inst_type: &str, inst_id: &str, client_oid: String) -> Self {
        Self {
            op: "trade",
            args: vec![TradeArg {
                id: new_request_id("cancel"),
                inst_type: inst_type.to_string(),
                inst_id: inst_id.to_string(),
                channel: "cancel-order",
                params: TradeParams::Cancel(CancelOrderParams { client_oid }),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_oid_prefix_roundtrip() {
        let buy = new_client_oid(Side::Buy);
        let sell = new_client_oid(Side::Sell);

        assert!(buy.starts_with("buy_"));
        assert!(sell.starts_with("sell_"));
        assert_eq!(Side::from_client_oid(&buy), Some(Side::Buy));
        assert_eq!(Side::from_client_oid(&sell), Some(Side::Sell));
        assert_eq!(Side::from_client_oid("manual_123"), None);
        assert_ne!(new_client_oid(Side::Buy), buy);
    }

    #[test]
    fn test_place_message_shape() {
        let msg = TradeMessage::place(
            "SPOT",
            "BTCUSDT",
            Side::Buy,
            "9990.00".into(),
            "0.000200".into(),
            "buy_1_abc".into(),
        );
        let v = serde_json::to_value(&msg).unwrap();

        assert_eq!(v["op"], "trade");
        let arg = &v["args"][0];
        assert_eq!(arg["instType"], "SPOT");
        assert_eq!(arg["instId"], "BTCUSDT");
        assert_eq!(arg["channel"], "place-order");
        assert!(arg["id"].as_str().unwrap().starts_with("trade-"));

        let params = &arg["params"];
        assert_eq!(params["orderType"], "limit");
        assert_eq!(params["side"], "buy");
        assert_eq!(params["size"], "0.000200");
        assert_eq!(params["price"], "9990.00");
        assert_eq!(params["force"], "post_only");
        assert_eq!(params["clientOid"], "buy_1_abc");
    }

    #[test]
    fn test_cancel_message_shape() {
        let v = serde_json::to_value(TradeMessage::cancel("SPOT", "BTCUSDT", "sell_1_x".into())).unwrap();
        let arg = &v["args"][0];
        assert_eq!(arg["channel"], "cancel-order");
        assert_eq!(arg["params"], serde_json::json!({ "clientOid": "sell_1_x" }));
    }

    #[test]
    fn test_subscription_message_shape() {
        let msg = SubscriptionMessage::subscribe(SubscriptionArg {
            inst_type: "SPOT".into(),
            channel: "ticker".into(),
            inst_id: "BTCUSDT".into(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "op": "subscribe",
                "args": [{ "instType": "SPOT", "channel": "ticker", "instId": "BTCUSDT" }]
            })
        );
    }
}
