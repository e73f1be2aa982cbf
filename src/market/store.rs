//! Order and trade persistence.
//!
//! Repository functions over the caller's transaction handle. The matching
//! engine writes every order state transition and every trade through these
//! inside the commit that also settles balances. Status writes enforce the
//! monotonic transition rule so a replayed or late write can never resurrect
//! a terminal order.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::error::{MarketError, Result};
use crate::market::types::{
    Order, OrderSide, OrderStatus, OrderType, TimeInForce, Trade,
};

const ORDER_COLUMNS: &str = "order_id, user_id, instrument_id, side, order_type, quantity,
    remaining, price, stop_price, trailing_offset, iceberg_visible, oco_group_id,
    time_in_force, status, client_order_id, leverage, created_at, updated_at";

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        order_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        instrument_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap_or_default(),
        side: OrderSide::from_str(&row.get::<_, String>(3)?).unwrap_or(OrderSide::Buy),
        order_type: OrderType::from_str(&row.get::<_, String>(4)?).unwrap_or(OrderType::Limit),
        quantity: row.get(5)?,
        remaining: row.get(6)?,
        price: row.get(7)?,
        stop_price: row.get(8)?,
        trailing_offset: row.get(9)?,
        iceberg_visible: row.get(10)?,
        oco_group_id: row.get(11)?,
        time_in_force: TimeInForce::from_str(&row.get::<_, String>(12)?)
            .unwrap_or(TimeInForce::Gtc),
        status: OrderStatus::from_str(&row.get::<_, String>(13)?).unwrap_or(OrderStatus::Pending),
        client_order_id: row.get(14)?,
        leverage: row.get(15)?,
        created_at: row
            .get::<_, String>(16)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        updated_at: row
            .get::<_, String>(17)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub fn insert_order(tx: &Transaction<'_>, order: &Order) -> Result<()> {
    let result = tx.execute(
        "INSERT INTO orders (order_id, user_id, instrument_id, side, order_type, quantity,
            remaining, price, stop_price, trailing_offset, iceberg_visible, oco_group_id,
            time_in_force, status, client_order_id, leverage, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            order.order_id.to_string(),
            order.user_id.to_string(),
            order.instrument_id.to_string(),
            order.side.as_str(),
            order.order_type.as_str(),
            order.quantity,
            order.remaining,
            order.price,
            order.stop_price,
            order.trailing_offset,
            order.iceberg_visible,
            order.oco_group_id,
            order.time_in_force.as_str(),
            order.status.as_str(),
            order.client_order_id,
            order.leverage,
            order.created_at.to_rfc3339(),
            order.updated_at.to_rfc3339(),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(MarketError::Conflict("duplicate client_order_id".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Persist an order state transition, enforcing monotonicity.
pub fn update_order_state(
    tx: &Transaction<'_>,
    order_id: Uuid,
    status: OrderStatus,
    remaining: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM orders WHERE order_id = ?1",
            [order_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let current = OrderStatus::from_str(
        &current.ok_or_else(|| MarketError::NotFound("order".into()))?,
    )
    .unwrap_or(OrderStatus::Pending);

    if current != status && !current.can_transition_to(status) {
        return Err(MarketError::Conflict(format!(
            "order {order_id} cannot move {} -> {}",
            current.as_str(),
            status.as_str()
        )));
    }

    tx.execute(
        "UPDATE orders SET status = ?1, remaining = ?2, updated_at = ?3 WHERE order_id = ?4",
        params![status.as_str(), remaining, now.to_rfc3339(), order_id.to_string()],
    )?;
    Ok(())
}

pub fn get_order(tx: &Transaction<'_>, order_id: Uuid) -> Result<Option<Order>> {
    Ok(tx
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?1"),
            [order_id.to_string()],
            row_to_order,
        )
        .optional()?)
}

pub fn find_by_client_order_id(
    tx: &Transaction<'_>,
    user_id: Uuid,
    client_order_id: &str,
) -> Result<Option<Order>> {
    Ok(tx
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE user_id = ?1 AND client_order_id = ?2"
            ),
            params![user_id.to_string(), client_order_id],
            row_to_order,
        )
        .optional()?)
}

#[derive(Debug, Default, Clone)]
pub struct OrderFilter {
    pub instrument_id: Option<Uuid>,
    pub side: Option<OrderSide>,
    pub status: Option<OrderStatus>,
    pub limit: u32,
    pub offset: u32,
}

pub fn list_user_orders(
    tx: &Transaction<'_>,
    user_id: Uuid,
    filter: &OrderFilter,
) -> Result<Vec<Order>> {
    let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = ?1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

    if let Some(instrument) = filter.instrument_id {
        args.push(Box::new(instrument.to_string()));
        sql.push_str(&format!(" AND instrument_id = ?{}", args.len()));
    }
    if let Some(side) = filter.side {
        args.push(Box::new(side.as_str().to_string()));
        sql.push_str(&format!(" AND side = ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(Box::new(status.as_str().to_string()));
        sql.push_str(&format!(" AND status = ?{}", args.len()));
    }
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {} OFFSET {}", limit, filter.offset));

    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_order)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Non-terminal orders for one instrument in arrival order, for startup
/// recovery.
pub fn open_orders_for_instrument(tx: &Transaction<'_>, instrument_id: Uuid) -> Result<Vec<Order>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE instrument_id = ?1 AND status IN ('pending', 'partial')
         ORDER BY created_at ASC, order_id ASC"
    ))?;
    let rows = stmt
        .query_map([instrument_id.to_string()], row_to_order)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Instrument an OCO group is currently bound to, i.e. the instrument of
/// its live (non-terminal) members. `None` when the group has no live
/// members. Groups never span instruments; placement rejects a group id
/// that is already bound elsewhere.
pub fn oco_group_instrument(tx: &Transaction<'_>, group: &str) -> Result<Option<Uuid>> {
    let found: Option<String> = tx
        .query_row(
            "SELECT instrument_id FROM orders
             WHERE oco_group_id = ?1 AND status IN ('pending', 'partial')
             LIMIT 1",
            [group],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.and_then(|s| Uuid::parse_str(&s).ok()))
}

/// Every open order of one user (liquidation cancels these).
pub fn open_orders_for_user(tx: &Transaction<'_>, user_id: Uuid) -> Result<Vec<Order>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE user_id = ?1 AND status IN ('pending', 'partial')
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt
        .query_map([user_id.to_string()], row_to_order)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn insert_trade(tx: &Transaction<'_>, trade: &Trade) -> Result<()> {
    tx.execute(
        "INSERT INTO trades (trade_id, instrument_id, seq, buy_order_id, sell_order_id,
            buyer_id, seller_id, price, quantity, taker_fee_bdt, maker_fee_bdt, executed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            trade.trade_id.to_string(),
            trade.instrument_id.to_string(),
            trade.seq as i64,
            trade.buy_order_id.to_string(),
            trade.sell_order_id.to_string(),
            trade.buyer_id.to_string(),
            trade.seller_id.to_string(),
            trade.price,
            trade.quantity,
            trade.taker_fee_bdt,
            trade.maker_fee_bdt,
            trade.executed_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        trade_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        instrument_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        seq: row.get::<_, i64>(2)? as u64,
        buy_order_id: Uuid::parse_str(&row.get::<_, String>(3)?).unwrap_or_default(),
        sell_order_id: Uuid::parse_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        buyer_id: Uuid::parse_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        seller_id: Uuid::parse_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        price: row.get(7)?,
        quantity: row.get(8)?,
        taker_fee_bdt: row.get(9)?,
        maker_fee_bdt: row.get(10)?,
        executed_at: row
            .get::<_, String>(11)?
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub fn list_trades(
    tx: &Transaction<'_>,
    instrument_id: Option<Uuid>,
    limit: u32,
    offset: u32,
) -> Result<Vec<Trade>> {
    let limit = if limit == 0 { 100 } else { limit };
    let rows = match instrument_id {
        Some(id) => {
            let mut stmt = tx.prepare(
                "SELECT trade_id, instrument_id, seq, buy_order_id, sell_order_id, buyer_id,
                        seller_id, price, quantity, taker_fee_bdt, maker_fee_bdt, executed_at
                 FROM trades WHERE instrument_id = ?1
                 ORDER BY seq DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![id.to_string(), limit, offset], row_to_trade)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = tx.prepare(
                "SELECT trade_id, instrument_id, seq, buy_order_id, sell_order_id, buyer_id,
                        seller_id, price, quantity, taker_fee_bdt, maker_fee_bdt, executed_at
                 FROM trades ORDER BY executed_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![limit, offset], row_to_trade)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Highest persisted sequence number for an instrument; the engine resumes
/// its counter from here at startup.
pub fn max_trade_seq(tx: &Transaction<'_>, instrument_id: Uuid) -> Result<u64> {
    let max: Option<i64> = tx.query_row(
        "SELECT MAX(seq) FROM trades WHERE instrument_id = ?1",
        [instrument_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn sample_order(instrument: Uuid) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            instrument_id: instrument,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 5.0,
            remaining: 5.0,
            price: Some(10.0),
            stop_price: None,
            trailing_offset: None,
            iceberg_visible: None,
            oco_group_id: None,
            time_in_force: TimeInForce::Gtc,
            status: OrderStatus::Pending,
            client_order_id: None,
            leverage: 1.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_order_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let instrument = Uuid::new_v4();
        let order = sample_order(instrument);
        let id = order.order_id;

        db.with_tx(|tx| insert_order(tx, &order)).await.unwrap();
        let loaded = db.with_tx(move |tx| get_order(tx, id)).await.unwrap().unwrap();
        assert_eq!(loaded.price, Some(10.0));
        assert_eq!(loaded.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let db = Db::open_in_memory().unwrap();
        let order = sample_order(Uuid::new_v4());
        let id = order.order_id;

        db.with_tx(|tx| {
            insert_order(tx, &order)?;
            update_order_state(tx, id, OrderStatus::Filled, 0.0, Utc::now())
        })
        .await
        .unwrap();

        let err = db
            .with_tx(move |tx| update_order_state(tx, id, OrderStatus::Partial, 1.0, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id() {
        let db = Db::open_in_memory().unwrap();
        let mut a = sample_order(Uuid::new_v4());
        a.client_order_id = Some("client-1".into());
        let mut b = sample_order(a.instrument_id);
        b.user_id = a.user_id;
        b.client_order_id = Some("client-1".into());

        db.with_tx(|tx| insert_order(tx, &a)).await.unwrap();
        let err = db.with_tx(|tx| insert_order(tx, &b)).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_oco_group_binding_follows_live_members() {
        let db = Db::open_in_memory().unwrap();
        let instrument = Uuid::new_v4();
        let mut order = sample_order(instrument);
        order.oco_group_id = Some("G".into());
        let id = order.order_id;

        db.with_tx(|tx| insert_order(tx, &order)).await.unwrap();
        let bound = db.with_tx(|tx| oco_group_instrument(tx, "G")).await.unwrap();
        assert_eq!(bound, Some(instrument));
        assert_eq!(db.with_tx(|tx| oco_group_instrument(tx, "H")).await.unwrap(), None);

        // A group with no live members is free again.
        db.with_tx(move |tx| {
            update_order_state(tx, id, OrderStatus::Cancelled, 5.0, Utc::now())
        })
        .await
        .unwrap();
        assert_eq!(db.with_tx(|tx| oco_group_instrument(tx, "G")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_trade_seq_resume() {
        let db = Db::open_in_memory().unwrap();
        let instrument = Uuid::new_v4();
        let trade = Trade {
            trade_id: Uuid::new_v4(),
            instrument_id: instrument,
            seq: 7,
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            price: 10.0,
            quantity: 1.0,
            taker_fee_bdt: 0,
            maker_fee_bdt: 0,
            executed_at: Utc::now(),
        };

        db.with_tx(|tx| insert_trade(tx, &trade)).await.unwrap();
        let max = db.with_tx(move |tx| max_trade_seq(tx, instrument)).await.unwrap();
        assert_eq!(max, 7);
    }
}
