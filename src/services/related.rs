use crate::error::StoreError;
use crate::models::common::OrderId;
use crate::models::order::Order;
use crate::models::subscription::{RelationKind, Subscription};
use crate::services::database::OrderRepository;

/// Ids of orders related to `subscription`, from its cache when loaded, otherwise from order meta.
pub fn related_order_ids(
    repo: &dyn OrderRepository,
    subscription: &Subscription,
    kind: RelationKind,
) -> Result<Vec<OrderId>, StoreError> {
    if let Some(ids) = subscription.related().get(kind) {
        return Ok(ids.clone());
    }

    let mut ids: Vec<OrderId> = repo
        .find_orders_by_meta(kind.meta_key(), &subscription.id().to_string())?
        .into_iter()
        .map(|order| order.id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Most recent order among the parent and renewal orders.
pub fn last_order(repo: &dyn OrderRepository, subscription: &Subscription) -> Result<Option<Order>, StoreError> {
    let renewals = related_order_ids(repo, subscription, RelationKind::Renewal)?;
    let latest = renewals.into_iter().chain(subscription.parent_order_id()).max();

    match latest {
        Some(id) => repo.get_order(id).map(Some),
        None => Ok(None),
    }
}

/// Most recent renewal order, ignoring the parent.
pub fn last_renewal_order(
    repo: &dyn OrderRepository,
    subscription: &Subscription,
) -> Result<Option<Order>, StoreError> {
    match related_order_ids(repo, subscription, RelationKind::Renewal)?.into_iter().max() {
        Some(id) => repo.get_order(id).map(Some),
        None => Ok(None),
    }
}
