//! Scripted stand-in for the marketplace backend.

use std::collections::HashMap;

use async_trait::async_trait;
use hearth_primitives::UserId;
use hearth_realtime::{ActionError, FetchError, MutationRequest, MutationService, ViewContents, ViewFetcher, ViewKey};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Default)]
struct State {
	views: HashMap<ViewKey, ViewContents>,
	unread: u64,
	reject: bool,
	mutations: Vec<MutationRequest>,
}

/// Serves canned view contents and accepts or rejects every mutation.
#[derive(Default)]
pub struct ScriptBackend {
	state: Mutex<State>,
}

impl ScriptBackend {
	pub fn serve(&self, key: ViewKey, contents: ViewContents) {
		self.state.lock().views.insert(key, contents);
	}

	pub fn set_unread(&self, count: u64) {
		self.state.lock().unread = count;
	}

	pub fn reject_mutations(&self, reject: bool) {
		self.state.lock().reject = reject;
	}

	pub fn mutations(&self) -> Vec<MutationRequest> {
		self.state.lock().mutations.clone()
	}
}

#[async_trait]
impl MutationService for ScriptBackend {
	async fn mutate(&self, request: MutationRequest) -> Result<(), ActionError> {
		let mut state = self.state.lock();
		debug!(kind = %request.kind, target = %request.target_id, "scripted mutation");
		state.mutations.push(request);
		if state.reject {
			return Err(ActionError::Rejected("rejected by script".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl ViewFetcher for ScriptBackend {
	async fn fetch(&self, key: &ViewKey) -> Result<ViewContents, FetchError> {
		self.state
			.lock()
			.views
			.get(key)
			.cloned()
			.ok_or_else(|| FetchError::Unsupported(key.clone()))
	}

	async fn unread_count(&self, _user: &UserId) -> Result<u64, FetchError> {
		Ok(self.state.lock().unread)
	}
}
