//! Grid price math
//!
//! Base level, ideal ladder, constant-notional sizing and the integer price
//! keys used wherever prices are compared for equality.

use crate::config::AppConfig;

/// Absorbs representation error in `price / step` (e.g. 100.3 / 0.1)
const FLOOR_EPSILON: f64 = 1e-9;

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Integer key for a price at the given precision
pub fn price_key(price: f64, decimals: u32) -> i64 {
    (price * 10f64.powi(decimals as i32)).round() as i64
}

/// Fixed-precision wire formatting
pub fn format_decimal(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, value)
}

/// Ladder shape and sizing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridParams {
    pub step: f64,
    pub max_levels: usize,
    pub order_amount: f64,
    pub price_precision: u32,
    pub size_precision: u32,
}

impl GridParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            step: config.price_step,
            max_levels: config.max_orders,
            order_amount: config.order_amount_usdt,
            price_precision: config.price_precision,
            size_precision: config.size_precision,
        }
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.price_precision)
    }

    pub fn key(&self, price: f64) -> i64 {
        price_key(price, self.price_precision)
    }

    /// `floor(price / step) * step`
    pub fn base_price(&self, price: f64) -> f64 {
        let levels = (price / self.step + FLOOR_EPSILON).floor();
        self.round_price(levels * self.step)
    }

    /// Up to `max_levels` prices descending from the base, stopping before
    /// the first non-positive one
    pub fn ideal_ladder(&self, price: f64) -> Vec<f64> {
        let base = self.base_price(price);
        let mut ladder = Vec::with_capacity(self.max_levels);
        for i in 0..self.max_levels {
            let level = self.round_price(base - i as f64 * self.step);
            if level <= 0.0 {
                break;
            }
            ladder.push(level);
        }
        ladder
    }

    /// Constant notional per level: `round(order_amount / price, size_precision)`
    pub fn order_size(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        round_to(self.order_amount / price, self.size_precision)
    }

    /// Paired sell one step above a buy fill
    pub fn sell_price_for(&self, fill_price: f64) -> f64 {
        self.round_price(fill_price + self.step)
    }

    pub fn format_price(&self, price: f64) -> String {
        format_decimal(price, self.price_precision)
    }

    pub fn format_size(&self, size: f64) -> String {
        format_decimal(size, self.size_precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(step: f64, max_levels: usize) -> GridParams {
        GridParams {
            step,
            max_levels,
            order_amount: 2.0,
            price_precision: 2,
            size_precision: 6,
        }
    }

    #[test]
    fn test_base_and_ladder_example() {
        let p = params(10.0, 3);
        assert_eq!(p.base_price(10005.0), 10000.0);
        assert_eq!(p.ideal_ladder(10005.0), vec![10000.0, 9990.0, 9980.0]);
    }

    #[test]
    fn test_base_on_exact_multiple_and_fractional_step() {
        assert_eq!(params(10.0, 1).base_price(10010.0), 10010.0);
        assert_eq!(params(0.1, 1).base_price(100.3), 100.3);
        assert_eq!(params(0.5, 1).base_price(99.74), 99.5);
    }

    #[test]
    fn test_ladder_stops_before_zero() {
        assert_eq!(params(10.0, 5).ideal_ladder(25.0), vec![20.0, 10.0]);
        assert!(params(10.0, 5).ideal_ladder(5.0).is_empty());
    }

    #[test]
    fn test_ladder_properties_over_price_walk() {
        let p = params(2.5, 12);
        let mut price = 3.0;
        while price < 5_000.0 {
            let ladder = p.ideal_ladder(price);
            let base = p.base_price(price);

            assert!(ladder.len() <= p.max_levels);
            assert!(ladder.iter().all(|&l| l > 0.0));
            if let Some(&top) = ladder.first() {
                assert!(top <= base);
                assert!(top <= price + 1e-6);
            }
            for pair in ladder.windows(2) {
                assert!(pair[0] > pair[1]);
            }
            for &level in &ladder {
                let steps = level / p.step;
                assert!((steps - steps.round()).abs() < 1e-6, "{} not a multiple of step", level);
            }
            price += 7.31;
        }
    }

    #[test]
    fn test_order_size_constant_notional() {
        let p = params(10.0, 3);
        assert_eq!(p.order_size(9990.0), 0.0002);
        assert_eq!(p.format_size(p.order_size(9990.0)), "0.000200");
        assert_eq!(p.order_size(0.0), 0.0);
    }

    #[test]
    fn test_sell_price_and_keys() {
        let p = params(10.0, 3);
        assert_eq!(p.sell_price_for(9990.0), 10000.0);
        assert_eq!(p.key(9990.0), p.key(9989.999999));
        assert_ne!(p.key(9990.0), p.key(9990.01));
        assert_eq!(p.format_price(9990.0), "9990.00");
    }
}
