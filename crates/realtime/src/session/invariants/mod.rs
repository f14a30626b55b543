//! Machine-checkable invariant catalog and proof entrypoints for realtime session behavior.
#![allow(dead_code)]

pub(crate) mod catalog;

#[allow(unused_imports)]
pub(crate) use catalog::{
	FAILED_ACTION_RESTORES_OR_INVALIDATES, OPTIMISTIC_ENTRY_AND_ECHO_COLLAPSE, REDELIVERY_IS_NOOP,
	RESUME_INVALIDATES_DEPENDENT_VIEWS, ROUTER_DROPS_STALE_GENERATION_EVENTS, ROUTER_PRESERVES_DELIVERY_ORDER,
	SINGLEFLIGHT_SUBSCRIBE_PER_TOPIC, SUPERSEDED_REFETCH_IS_DISCARDED, UNREAD_COUNTER_NEVER_NEGATIVE,
};

#[cfg(doc)]
pub(crate) async fn test_concurrent_open_performs_one_handshake() {}

#[cfg(doc)]
pub(crate) async fn test_router_drops_stale_generation_changes() {}

#[cfg(doc)]
pub(crate) async fn test_router_preserves_delivery_order() {}

#[cfg(doc)]
pub(crate) fn test_redelivery_is_noop() {}

#[cfg(doc)]
pub(crate) async fn test_optimistic_send_and_echo_collapse() {}

#[cfg(doc)]
pub(crate) fn test_unread_counter_never_negative() {}

#[cfg(doc)]
pub(crate) async fn test_resume_invalidates_dependent_views() {}

#[cfg(doc)]
pub(crate) async fn test_superseded_refetch_is_discarded() {}

#[cfg(doc)]
pub(crate) async fn test_failed_action_restores_unchanged_views() {}

#[cfg(test)]
mod proofs;

#[cfg(test)]
#[allow(unused_imports)]
pub(crate) use proofs::{
	test_concurrent_open_performs_one_handshake, test_failed_action_restores_unchanged_views,
	test_optimistic_send_and_echo_collapse, test_redelivery_is_noop, test_resume_invalidates_dependent_views,
	test_router_drops_stale_generation_changes, test_router_preserves_delivery_order,
	test_superseded_refetch_is_discarded, test_unread_counter_never_negative,
};
