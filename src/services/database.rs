use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::common::{CustomerId, OrderId};
use crate::models::order::{Order, OrderData, OrderNote, OrderType};
use crate::models::subscription::Subscription;

pub type TransactionId = u64;

/// Generic order persistence consumed by the engine.
pub trait OrderRepository: Send + Sync {
    fn get_order(&self, id: OrderId) -> Result<Order, StoreError>;

    /// Stores a new order and returns it with its assigned id.
    fn insert_order(&self, order: Order) -> Result<Order, StoreError>;

    /// Overwrites an existing order row and its meta.
    fn save_order(&self, order: &Order) -> Result<(), StoreError>;

    fn find_orders_by_meta(&self, key: &str, value: &str) -> Result<Vec<Order>, StoreError>;

    fn add_note(&self, order_id: OrderId, note: OrderNote) -> Result<(), StoreError>;

    fn notes(&self, order_id: OrderId) -> Result<Vec<OrderNote>, StoreError>;

    /// Opens a transaction scoped to the orders inserted through it.
    fn begin_transaction(&self) -> Result<TransactionId, StoreError>;

    /// Inserts an order that is undone if `tx` rolls back.
    fn insert_order_in(&self, tx: TransactionId, order: Order) -> Result<Order, StoreError>;

    fn commit(&self, tx: TransactionId) -> Result<(), StoreError>;

    /// Removes the orders inserted under `tx`, with their meta and notes. Other writes are kept.
    fn rollback(&self, tx: TransactionId) -> Result<(), StoreError>;
}

/// Order row without its meta, which lives in its own table.
#[derive(Debug, Clone)]
struct OrderRow {
    order_type: OrderType,
    status: String,
    parent_id: Option<OrderId>,
    customer_id: CustomerId,
    data: OrderData,
}

#[derive(Debug, Default)]
struct Tables {
    orders: BTreeMap<OrderId, OrderRow>,
    order_meta: BTreeMap<(OrderId, String), String>,
    order_notes: Vec<(OrderId, OrderNote)>,
    next_id: OrderId,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: Tables,
    journals: HashMap<TransactionId, Vec<OrderId>>,
    next_transaction: TransactionId,
    failing_saves: u32,
    failing_inserts: u32,
}

/// In-process order store: an orders table, a key/value meta table and a notes table.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `save_order` fail.
    pub fn fail_next_saves(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.failing_saves = count;
        }
    }

    /// Makes the next `count` calls to `insert_order` fail.
    pub fn fail_next_inserts(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.failing_inserts = count;
        }
    }

    pub fn order_count(&self) -> usize {
        self.lock().map(|state| state.tables.orders.len()).unwrap_or(0)
    }

    /// Raw meta value as stored, for inspecting the persisted layout.
    pub fn meta_value(&self, order_id: OrderId, key: &str) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|state| state.tables.order_meta.get(&(order_id, key.to_string())).cloned())
    }

    pub fn subscription(&self, id: OrderId) -> Result<Subscription, StoreError> {
        Subscription::from_order(self.get_order(id)?)
    }

    pub fn open_transactions(&self) -> usize {
        self.lock().map(|state| state.journals.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("order store lock poisoned".to_string()))
    }

    fn write_row(tables: &mut Tables, id: OrderId, order: &Order) {
        let mut data = order.data.clone();
        let meta = std::mem::take(&mut data.meta);

        tables.orders.insert(
            id,
            OrderRow {
                order_type: order.order_type,
                status: order.status.clone(),
                parent_id: order.parent_id,
                customer_id: order.customer_id,
                data,
            },
        );

        tables.order_meta.retain(|(order_id, _), _| *order_id != id);
        for (key, value) in meta {
            tables.order_meta.insert((id, key), value);
        }
    }

    fn insert_row(state: &mut StoreState, mut order: Order) -> Result<Order, StoreError> {
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Unavailable("insert rejected".to_string()));
        }

        state.tables.next_id += 1;
        order.id = state.tables.next_id;
        Self::write_row(&mut state.tables, order.id, &order);
        log::debug!("Inserted {} #{}", order.order_type.as_str(), order.id);
        Ok(order)
    }

    fn remove_row(tables: &mut Tables, id: OrderId) {
        tables.orders.remove(&id);
        tables.order_meta.retain(|(order_id, _), _| *order_id != id);
        tables.order_notes.retain(|(order_id, _)| *order_id != id);
    }

    fn read_row(tables: &Tables, id: OrderId) -> Option<Order> {
        let row = tables.orders.get(&id)?;
        let mut data = row.data.clone();
        data.meta = tables
            .order_meta
            .range((id, String::new())..)
            .take_while(|((order_id, _), _)| *order_id == id)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();

        Some(Order {
            id,
            order_type: row.order_type,
            status: row.status.clone(),
            parent_id: row.parent_id,
            customer_id: row.customer_id,
            data,
        })
    }
}

impl OrderRepository for InMemoryStore {
    fn get_order(&self, id: OrderId) -> Result<Order, StoreError> {
        let state = self.lock()?;
        Self::read_row(&state.tables, id).ok_or(StoreError::NotFound(id))
    }

    fn insert_order(&self, order: Order) -> Result<Order, StoreError> {
        let mut state = self.lock()?;
        Self::insert_row(&mut state, order)
    }

    fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            return Err(StoreError::Unavailable("save rejected".to_string()));
        }
        if !state.tables.orders.contains_key(&order.id) {
            return Err(StoreError::NotFound(order.id));
        }

        Self::write_row(&mut state.tables, order.id, order);
        Ok(())
    }

    fn find_orders_by_meta(&self, key: &str, value: &str) -> Result<Vec<Order>, StoreError> {
        let state = self.lock()?;
        let orders = state
            .tables
            .order_meta
            .iter()
            .filter(|((_, meta_key), meta_value)| meta_key == key && meta_value.as_str() == value)
            .filter_map(|((order_id, _), _)| Self::read_row(&state.tables, *order_id))
            .collect();
        Ok(orders)
    }

    fn add_note(&self, order_id: OrderId, note: OrderNote) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.tables.orders.contains_key(&order_id) {
            return Err(StoreError::NotFound(order_id));
        }
        state.tables.order_notes.push((order_id, note));
        Ok(())
    }

    fn notes(&self, order_id: OrderId) -> Result<Vec<OrderNote>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .tables
            .order_notes
            .iter()
            .filter(|(id, _)| *id == order_id)
            .map(|(_, note)| note.clone())
            .collect())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StoreError> {
        let mut state = self.lock()?;
        state.next_transaction += 1;
        let tx = state.next_transaction;
        state.journals.insert(tx, Vec::new());
        Ok(tx)
    }

    fn insert_order_in(&self, tx: TransactionId, order: Order) -> Result<Order, StoreError> {
        let mut state = self.lock()?;
        if !state.journals.contains_key(&tx) {
            return Err(StoreError::Transaction(format!("transaction {} is not open", tx)));
        }

        let order = Self::insert_row(&mut state, order)?;
        if let Some(journal) = state.journals.get_mut(&tx) {
            journal.push(order.id);
        }
        Ok(order)
    }

    fn commit(&self, tx: TransactionId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .journals
            .remove(&tx)
            .map(|_| ())
            .ok_or_else(|| StoreError::Transaction(format!("transaction {} is not open", tx)))
    }

    fn rollback(&self, tx: TransactionId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let inserted = state
            .journals
            .remove(&tx)
            .ok_or_else(|| StoreError::Transaction(format!("transaction {} is not open", tx)))?;

        for id in inserted {
            Self::remove_row(&mut state.tables, id);
            log::debug!("Rolled back order #{}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn shop_order() -> Order {
        Order::new(5, OrderData::new("USD", Utc::now()))
    }

    #[test]
    fn test_insert_and_get() {
        let store = InMemoryStore::new();
        let mut order = shop_order();
        order.add_meta("subscription_renewal", "9");

        let created = store.insert_order(order).unwrap();
        assert_eq!(created.id, 1);

        let loaded = store.get_order(created.id).unwrap();
        assert_eq!(loaded, created);
        assert_eq!(store.meta_value(1, "subscription_renewal").as_deref(), Some("9"));
        assert!(matches!(store.get_order(2), Err(StoreError::NotFound(2))));
    }

    #[test]
    fn test_save_replaces_meta_rows() {
        let store = InMemoryStore::new();
        let mut order = shop_order();
        order.add_meta("a", "1");
        let mut order = store.insert_order(order).unwrap();

        order.data.meta.clear();
        order.add_meta("b", "2");
        store.save_order(&order).unwrap();

        assert_eq!(store.meta_value(order.id, "a"), None);
        assert_eq!(store.meta_value(order.id, "b").as_deref(), Some("2"));
    }

    #[test]
    fn test_find_by_meta() {
        let store = InMemoryStore::new();
        for parent in ["7", "7", "8"] {
            let mut order = shop_order();
            order.add_meta("subscription_renewal", parent);
            store.insert_order(order).unwrap();
        }

        let found = store.find_orders_by_meta("subscription_renewal", "7").unwrap();
        assert_eq!(found.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_rollback_discards_inserts() {
        let store = InMemoryStore::new();
        store.insert_order(shop_order()).unwrap();

        let tx = store.begin_transaction().unwrap();
        let pending = store.insert_order_in(tx, shop_order()).unwrap();
        store
            .add_note(
                pending.id,
                OrderNote {
                    content: "draft".to_string(),
                    added_by_user: false,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        assert_eq!(store.order_count(), 2);
        store.rollback(tx).unwrap();

        assert_eq!(store.order_count(), 1);
        assert!(store.notes(pending.id).unwrap().is_empty());
        assert!(store.commit(tx).is_err());
        assert_eq!(store.open_transactions(), 0);

        // Ids are never handed out twice.
        let next = store.insert_order(shop_order()).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_rollback_keeps_writes_outside_the_transaction() {
        let store = InMemoryStore::new();
        let mut other = store.insert_order(shop_order()).unwrap();

        let first = store.begin_transaction().unwrap();
        let second = store.begin_transaction().unwrap();
        let discarded = store.insert_order_in(first, shop_order()).unwrap();
        let kept = store.insert_order_in(second, shop_order()).unwrap();

        other.add_meta("status_note", "saved meanwhile");
        store.save_order(&other).unwrap();
        let unrelated = store.insert_order(shop_order()).unwrap();

        store.rollback(first).unwrap();
        store.commit(second).unwrap();

        assert!(matches!(store.get_order(discarded.id), Err(StoreError::NotFound(_))));
        assert!(store.get_order(kept.id).is_ok());
        assert!(store.get_order(unrelated.id).is_ok());
        assert_eq!(store.meta_value(other.id, "status_note").as_deref(), Some("saved meanwhile"));
    }

    #[test]
    fn test_insert_in_closed_transaction_fails() {
        let store = InMemoryStore::new();
        let tx = store.begin_transaction().unwrap();
        store.commit(tx).unwrap();

        assert!(matches!(
            store.insert_order_in(tx, shop_order()),
            Err(StoreError::Transaction(_))
        ));
        assert_eq!(store.order_count(), 0);
    }

    #[test]
    fn test_failure_injection() {
        let store = InMemoryStore::new();
        let order = store.insert_order(shop_order()).unwrap();

        store.fail_next_saves(1);
        assert!(store.save_order(&order).is_err());
        assert!(store.save_order(&order).is_ok());

        store.fail_next_inserts(1);
        assert!(store.insert_order(shop_order()).is_err());
    }

    #[test]
    fn test_notes_require_existing_order() {
        let store = InMemoryStore::new();
        let note = OrderNote {
            content: "hello".to_string(),
            added_by_user: false,
            created_at: Utc::now(),
        };
        assert!(store.add_note(1, note.clone()).is_err());

        let order = store.insert_order(shop_order()).unwrap();
        store.add_note(order.id, note).unwrap();
        assert_eq!(store.notes(order.id).unwrap().len(), 1);
    }
}
