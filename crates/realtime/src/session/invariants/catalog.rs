//! Invariant catalog for [`crate::session::RealtimeSession`].
#![allow(dead_code)]

/// Must singleflight the subscribe handshake per topic.
///
/// - Enforced in: [`crate::registry::SubscriptionRegistry::subscribe`]
/// - Tested by: [`crate::session::invariants::test_concurrent_open_performs_one_handshake`]
/// - Failure symptom: Duplicate channels deliver every change twice and leak on teardown.
pub(crate) const SINGLEFLIGHT_SUBSCRIBE_PER_TOPIC: () = ();

/// Router must discard changes tagged with a retired subscription id.
///
/// - Enforced in: `Router::on_transport_event`, [`crate::registry::SubscriptionRegistry::topic_for`]
/// - Tested by: [`crate::session::invariants::test_router_drops_stale_generation_changes`]
/// - Failure symptom: Late rows from a dropped channel land after the resume refetch and resurrect old state.
pub(crate) const ROUTER_DROPS_STALE_GENERATION_EVENTS: () = ();

/// Router must apply changes of one topic in delivery order.
///
/// - Enforced in: `Router::run`
/// - Tested by: [`crate::session::invariants::test_router_preserves_delivery_order`]
/// - Failure symptom: Transcripts render messages out of order.
pub(crate) const ROUTER_PRESERVES_DELIVERY_ORDER: () = ();

/// Re-applying an entity whose identity was already applied must be a no-op.
///
/// - Enforced in: [`crate::reducer::LocalReducerStore::apply`], `Timeline::insert`
/// - Tested by: [`crate::session::invariants::test_redelivery_is_noop`]
/// - Failure symptom: Duplicate messages and an inflated unread counter after reconnects.
pub(crate) const REDELIVERY_IS_NOOP: () = ();

/// An optimistic entry and its confirming echo must collapse into one entry.
///
/// - Enforced in: `Timeline::insert` (matching on `client_id`)
/// - Tested by: [`crate::session::invariants::test_optimistic_send_and_echo_collapse`]
/// - Failure symptom: The sender sees their own message twice.
pub(crate) const OPTIMISTIC_ENTRY_AND_ECHO_COLLAPSE: () = ();

/// Unread counters must never go negative; mark-all-read yields exactly zero.
///
/// - Enforced in: [`crate::reducer::UnreadCounter::decrement`], [`crate::reducer::LocalReducerStore::mark_all_read`]
/// - Tested by: [`crate::session::invariants::test_unread_counter_never_negative`]
/// - Failure symptom: Badge shows a wrapped or negative count.
pub(crate) const UNREAD_COUNTER_NEVER_NEGATIVE: () = ();

/// `Reconnecting -> Active` must invalidate every view fed by the topic.
///
/// - Enforced in: `Router::on_registry_event`, [`crate::propagate::CacheCoherencePropagator::invalidate_topic`]
/// - Tested by: [`crate::session::invariants::test_resume_invalidates_dependent_views`]
/// - Failure symptom: Changes missed during the outage never show up.
pub(crate) const RESUME_INVALIDATES_DEPENDENT_VIEWS: () = ();

/// A refetch result must not overwrite a view invalidated after the fetch
/// started, nor a live change to a counter, toast queue or record.
///
/// - Enforced in: [`crate::propagate::CacheCoherencePropagator::install_refetch`] (epoch check),
///   `PropagatorState::set_contents` (epoch bump for views that do not merge refetches)
/// - Tested by: [`crate::session::invariants::test_superseded_refetch_is_discarded`]
/// - Failure symptom: A slow fetch reverts a view to pre-change contents.
pub(crate) const SUPERSEDED_REFETCH_IS_DISCARDED: () = ();

/// A failed action restores views unchanged since its patch and invalidates the rest.
/// Nothing is written back once the session state was cleared.
///
/// - Enforced in: [`crate::dispatch::ActionDispatcher::dispatch`], `Coherence::rollback` (reset count check)
/// - Tested by: [`crate::session::invariants::test_failed_action_restores_unchanged_views`]
/// - Failure symptom: Rollback clobbers state the server changed meanwhile, or leaves a phantom success.
pub(crate) const FAILED_ACTION_RESTORES_OR_INVALIDATES: () = ();
