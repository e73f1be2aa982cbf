//! Pre-trade risk validation.
//!
//! Stateless checks run before an order touches the book: instrument status,
//! tick/lot alignment, notional cap, leverage bounds, margin sufficiency,
//! position-size and per-instrument exposure limits. Market orders are
//! validated against an estimated price supplied by the pricing engine.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ConfigProvider;
use crate::error::{MarketError, Result};
use crate::market::instruments::{Instrument, InstrumentStatus};
use crate::market::margin::{MarginService, PositionSide};
use crate::market::types::{
    price_to_ticks, qty_to_lots, OrderSide, OrderType, PlaceOrder, TimeInForce,
};

pub struct RiskEngine {
    config: Arc<ConfigProvider>,
    margin: Arc<MarginService>,
}

impl RiskEngine {
    pub fn new(config: Arc<ConfigProvider>, margin: Arc<MarginService>) -> Self {
        Self { config, margin }
    }

    /// Shape-level validation: statuses, alignment, field consistency.
    pub fn validate_shape(&self, instrument: &Instrument, order: &PlaceOrder) -> Result<()> {
        if instrument.status != InstrumentStatus::Active {
            return Err(MarketError::MarketNotOpen(format!(
                "instrument {} is {}",
                instrument.symbol,
                instrument.status.as_str()
            )));
        }

        if qty_to_lots(order.quantity, instrument.lot_size).is_none() {
            return Err(MarketError::validation_with(
                "quantity must be a positive multiple of lot_size",
                json!({ "quantity": [format!("lot size is {}", instrument.lot_size)] }),
            ));
        }

        for (name, price) in [("price", order.price), ("stop_price", order.stop_price)] {
            if let Some(p) = price {
                if price_to_ticks(p, instrument.tick_size).is_none() {
                    return Err(MarketError::validation_with(
                        format!("{name} must align to tick_size"),
                        json!({ name: [format!("tick size is {}", instrument.tick_size)] }),
                    ));
                }
            }
        }

        match order.order_type {
            OrderType::Market => {
                if order.price.is_some() {
                    return Err(MarketError::validation("market orders cannot carry a price"));
                }
            }
            OrderType::Limit | OrderType::Iceberg => {
                if order.price.is_none() {
                    return Err(MarketError::validation("limit price required"));
                }
            }
            OrderType::Stop => {
                if order.stop_price.is_none() {
                    return Err(MarketError::validation("stop_price required"));
                }
            }
            OrderType::StopLimit => {
                if order.stop_price.is_none() || order.price.is_none() {
                    return Err(MarketError::validation(
                        "stop_limit requires stop_price and price",
                    ));
                }
            }
            OrderType::TrailingStop => {
                if !matches!(order.trailing_offset, Some(o) if o > 0.0) {
                    return Err(MarketError::validation(
                        "trailing_stop requires a positive trailing_offset",
                    ));
                }
            }
        }

        if order.order_type == OrderType::Iceberg {
            match order.iceberg_visible {
                Some(visible) if visible > 0.0 && visible <= order.quantity => {
                    if qty_to_lots(visible, instrument.lot_size).is_none() {
                        return Err(MarketError::validation(
                            "iceberg_visible must be a multiple of lot_size",
                        ));
                    }
                }
                _ => {
                    return Err(MarketError::validation(
                        "iceberg_visible must be in (0, quantity]",
                    ))
                }
            }
        }

        // FOK needs a limit to define "acceptable prices".
        if order.time_in_force == TimeInForce::Fok
            && order.order_type != OrderType::Limit
            && order.order_type != OrderType::Iceberg
        {
            return Err(MarketError::validation("FOK applies to limit orders"));
        }

        if order.leverage < 1.0 {
            return Err(MarketError::validation("leverage must be >= 1"));
        }
        if order.leverage > 1.0 && !instrument.margin_allowed {
            return Err(MarketError::validation("instrument does not allow margin trading"));
        }
        if order.leverage > 1.0
            && order.side == OrderSide::Sell
            && !instrument.short_allowed
        {
            return Err(MarketError::validation("instrument does not allow short selling"));
        }

        Ok(())
    }

    /// Full pre-trade check. `reference_price` is the limit price, or the
    /// pricing-engine estimate for market/stop orders.
    pub async fn validate(
        &self,
        user_id: Uuid,
        account_leverage_max: f64,
        instrument: &Instrument,
        order: &PlaceOrder,
        reference_price: f64,
    ) -> Result<()> {
        self.validate_shape(instrument, order)?;
        let cfg = self.config.snapshot();

        let notional = reference_price * order.quantity;
        if notional.round() as i64 > cfg.max_order_notional_bdt {
            return Err(MarketError::validation(format!(
                "order notional {notional:.0} exceeds the {} cap",
                cfg.max_order_notional_bdt
            )));
        }

        let leverage_cap = account_leverage_max.min(instrument.leverage_max);
        if order.leverage > leverage_cap {
            return Err(MarketError::validation(format!(
                "leverage {}x exceeds the {leverage_cap}x limit",
                order.leverage
            )));
        }

        let metrics = self.margin.account_metrics(user_id).await?;

        if order.leverage > 1.0 {
            // Margin sufficiency for the opening portion.
            let required =
                self.margin.required_margin(notional, order.leverage, instrument.leverage_max);
            if metrics.free_margin < required {
                return Err(MarketError::MarginInsufficient(format!(
                    "need {required:.2}, have {:.2} free",
                    metrics.free_margin
                )));
            }

            // Position size cap as a share of equity.
            let max_position = cfg.max_position_pct * metrics.equity;
            if notional > max_position {
                return Err(MarketError::validation(format!(
                    "position notional {notional:.0} exceeds {}% of equity",
                    cfg.max_position_pct * 100.0
                )));
            }

            // Absolute per-instrument exposure cap.
            let current: f64 = self
                .margin
                .positions(user_id)
                .await?
                .iter()
                .filter(|p| p.instrument_id == instrument.instrument_id)
                .map(|p| match p.side {
                    PositionSide::Long => p.quantity * p.entry_price,
                    PositionSide::Short => -p.quantity * p.entry_price,
                })
                .sum();
            let signed = match order.side {
                OrderSide::Buy => notional,
                OrderSide::Sell => -notional,
            };
            let exposure = (current + signed).abs();
            let max_exposure = cfg.max_instrument_exposure_pct * metrics.equity;
            if exposure > max_exposure {
                return Err(MarketError::validation(format!(
                    "instrument exposure {exposure:.0} exceeds {}% of equity",
                    cfg.max_instrument_exposure_pct * 100.0
                )));
            }
        } else if order.side == OrderSide::Buy {
            // Spot buys settle cash: the worst-case notional plus taker fee
            // must be coverable.
            let fee = (notional * cfg.taker_fee_bp / 10_000.0).max(0.0);
            let required = (notional + fee).round() as i64;
            if metrics.balance_bdt < required {
                return Err(MarketError::InsufficientFunds {
                    available: metrics.balance_bdt,
                    required,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::ConfigSnapshot;
    use crate::db::Db;
    use crate::market::instruments::{AssetClass, InstrumentStore};
    use crate::pricing::PricingEngine;
    use chrono::Utc;

    fn instrument() -> Instrument {
        Instrument {
            instrument_id: Uuid::new_v4(),
            symbol: "ACME".into(),
            asset_class: AssetClass::Equity,
            tick_size: 0.5,
            lot_size: 1.0,
            leverage_max: 20.0,
            margin_allowed: true,
            short_allowed: true,
            status: InstrumentStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn order(order_type: OrderType, qty: f64, price: Option<f64>) -> PlaceOrder {
        PlaceOrder {
            instrument_id: Uuid::new_v4(),
            side: OrderSide::Buy,
            order_type,
            quantity: qty,
            price,
            stop_price: None,
            trailing_offset: None,
            iceberg_visible: None,
            oco_group_id: None,
            time_in_force: TimeInForce::Gtc,
            client_order_id: None,
            leverage: 1.0,
        }
    }

    fn risk_engine() -> RiskEngine {
        let db = Db::open_in_memory().unwrap();
        let config = Arc::new(ConfigProvider::new(ConfigSnapshot::default()));
        let clock = Clock::new();
        let pricing = Arc::new(PricingEngine::new(config.clone(), clock.clone()));
        let instruments = Arc::new(InstrumentStore::new(db.clone(), clock.clone()));
        let margin = Arc::new(MarginService::new(db, clock, config.clone(), pricing, instruments));
        RiskEngine::new(config, margin)
    }

    #[test]
    fn test_misaligned_quantity_rejected() {
        let engine = risk_engine();
        let err = engine
            .validate_shape(&instrument(), &order(OrderType::Limit, 1.5, Some(10.0)))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_misaligned_price_rejected() {
        let engine = risk_engine();
        let err = engine
            .validate_shape(&instrument(), &order(OrderType::Limit, 1.0, Some(10.3)))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_halted_instrument_rejected() {
        let engine = risk_engine();
        let mut halted = instrument();
        halted.status = InstrumentStatus::Halted;
        let err = engine
            .validate_shape(&halted, &order(OrderType::Limit, 1.0, Some(10.0)))
            .unwrap_err();
        assert_eq!(err.code(), "MARKET_NOT_OPEN");
    }

    #[test]
    fn test_market_order_with_price_rejected() {
        let engine = risk_engine();
        let err = engine
            .validate_shape(&instrument(), &order(OrderType::Market, 1.0, Some(10.0)))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_iceberg_requires_valid_slice() {
        let engine = risk_engine();
        let mut iceberg = order(OrderType::Iceberg, 5.0, Some(10.0));
        iceberg.iceberg_visible = Some(6.0); // bigger than quantity
        assert!(engine.validate_shape(&instrument(), &iceberg).is_err());

        iceberg.iceberg_visible = Some(2.0);
        assert!(engine.validate_shape(&instrument(), &iceberg).is_ok());
    }

    #[tokio::test]
    async fn test_notional_cap() {
        let engine = risk_engine();
        let big = order(OrderType::Limit, 1_000_000.0, Some(500.0));
        let err = engine
            .validate(Uuid::new_v4(), 50.0, &instrument(), &big, 500.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_leverage_cap_uses_min_of_account_and_instrument() {
        let engine = risk_engine();
        let mut leveraged = order(OrderType::Limit, 1.0, Some(10.0));
        leveraged.leverage = 30.0; // instrument allows 20x
        let err = engine
            .validate(Uuid::new_v4(), 50.0, &instrument(), &leveraged, 10.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("leverage"));
    }
}
