//! Applying stream events to the store.
//!
//! Pure functions of (store, event): no I/O, no clocks beyond the `now`
//! passed in for typing eviction.

use std::time::Instant;

use murmur_shared::{InboundEvent, PresenceStatus, StateError};
use tracing::debug;

use crate::store::{MessageOrigin, Store};

/// Apply one inbound event. Only message delivery can fail; a failure leaves
/// the store unchanged.
pub fn apply_event(store: &mut Store, event: &InboundEvent, now: Instant) -> Result<(), StateError> {
    match event {
        InboundEvent::MessageReceived(message) => {
            store.append_message(message.clone(), MessageOrigin::Remote)?;
        }

        InboundEvent::UserConnected(user) => {
            store.apply_presence(&user.id, PresenceStatus::Online, user.last_seen);
        }

        InboundEvent::UserDisconnected(user) => {
            store.apply_presence(&user.id, PresenceStatus::Offline, user.last_seen);
        }

        // Additive: users missing from the snapshot keep whatever they had.
        InboundEvent::UserList(users) => {
            let changed = users
                .iter()
                .filter(|u| store.apply_presence(&u.id, u.status, u.last_seen))
                .count();
            debug!(listed = users.len(), changed, "Presence snapshot applied");
        }

        InboundEvent::TypingUpdate(update) => {
            let entry = update.entry();
            if update.is_typing {
                store.add_typing_entry_at(entry, now);
            } else {
                store.remove_typing_entry(&entry);
            }
        }
    }
    Ok(())
}
