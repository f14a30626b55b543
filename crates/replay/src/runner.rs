//! Executes a script against a live session and emits JSON lines.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hearth_primitives::ClientId;
use hearth_realtime::{
	ActionKind, CachedView, EngineConfig, MemoryTransport, PendingStatus, RealtimeSession, SessionBackends, SessionUser,
	UserAlert,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::ScriptBackend;
use crate::script::Step;

/// One line of replay output.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output {
	View { step: usize, view: CachedView },
	Update { view: CachedView },
	Action { step: usize, action: ActionKind, local_id: ClientId, status: PendingStatus },
	ActionFailed { step: usize, action: ActionKind, error: String },
	Alert { step: usize, alert: String },
	Missed { step: usize, reason: String },
}

fn describe(alert: &UserAlert) -> String {
	match alert {
		UserAlert::ActionFailed { kind, message, .. } => format!("{kind} failed: {message}"),
		UserAlert::Degraded { topic } => format!("{topic} degraded"),
		UserAlert::Recovered { topic } => format!("{topic} recovered"),
	}
}

pub struct Runner {
	session: RealtimeSession,
	transport: Arc<MemoryTransport>,
	backend: Arc<ScriptBackend>,
	alerts: broadcast::Receiver<UserAlert>,
	/// Pause after each step so background tasks can drain.
	settle: Duration,
	updates: Arc<Mutex<Vec<CachedView>>>,
	output: Vec<Output>,
}

impl Runner {
	pub async fn start(config: EngineConfig, user: SessionUser, settle: Duration) -> anyhow::Result<Self> {
		let transport = Arc::new(MemoryTransport::new());
		let backend = Arc::new(ScriptBackend::default());
		let backends = SessionBackends {
			transport: transport.clone(),
			mutations: backend.clone(),
			fetcher: backend.clone(),
		};
		let session = RealtimeSession::start(config, user, backends)
			.await
			.context("starting realtime session")?;
		let alerts = session.alerts();
		Ok(Self {
			session,
			transport,
			backend,
			alerts,
			settle,
			updates: Arc::default(),
			output: Vec::new(),
		})
	}

	pub async fn run(&mut self, steps: Vec<Step>) -> anyhow::Result<()> {
		for (index, step) in steps.into_iter().enumerate() {
			let step_no = index + 1;
			debug!(step = step_no, ?step, "replaying step");
			self.apply(step_no, step).await.with_context(|| format!("step {step_no}"))?;
			tokio::time::sleep(self.settle).await;
			self.drain(step_no);
		}
		Ok(())
	}

	async fn apply(&mut self, step_no: usize, step: Step) -> anyhow::Result<()> {
		match step {
			Step::Serve { view, contents } => self.backend.serve(view, contents),
			Step::Unread { count } => self.backend.set_unread(count),
			Step::Open { conversation } => {
				self.session.open_conversation(&conversation).await?;
			}
			Step::Close { conversation } => {
				self.session.close_conversation(&conversation).await;
			}
			Step::Watch { view } => {
				let updates = self.updates.clone();
				self.session.subscribe_to_view(view, move |update| updates.lock().push(update.clone()));
			}
			Step::Change { topic, change } => {
				if !self.transport.push(&topic, change) {
					self.missed(step_no, format!("{topic} has no open channel"));
				}
			}
			Step::Drop { topic } => {
				if !self.transport.drop_channel(&topic) {
					self.missed(step_no, format!("{topic} has no open channel"));
				}
			}
			Step::FailHandshakes { topic, count } => self.transport.fail_handshakes(&topic, count),
			Step::Reconnect { topic } => {
				if !self.session.reconnect(&topic) {
					self.missed(step_no, format!("{topic} is not closed"));
				}
			}
			Step::RejectMutations { enabled } => self.backend.reject_mutations(enabled),
			Step::Dispatch { action } => {
				let kind = action.kind();
				match self.session.dispatch(action).await {
					Ok(pending) => self.output.push(Output::Action {
						step: step_no,
						action: kind,
						local_id: pending.local_id,
						status: pending.status,
					}),
					Err(err) => self.output.push(Output::ActionFailed {
						step: step_no,
						action: kind,
						error: err.to_string(),
					}),
				}
			}
			Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
			Step::Print { view } => {
				let view = self.session.get_view(&view);
				self.output.push(Output::View { step: step_no, view });
			}
		}
		Ok(())
	}

	fn missed(&mut self, step: usize, reason: String) {
		warn!(step, reason = %reason, "step had no effect");
		self.output.push(Output::Missed { step, reason });
	}

	fn drain(&mut self, step: usize) {
		let updates = std::mem::take(&mut *self.updates.lock());
		self.output.extend(updates.into_iter().map(|view| Output::Update { view }));
		while let Ok(alert) = self.alerts.try_recv() {
			self.output.push(Output::Alert {
				step,
				alert: describe(&alert),
			});
		}
	}

	pub fn output(&self) -> &[Output] {
		&self.output
	}

	pub fn mutations(&self) -> usize {
		self.backend.mutations().len()
	}

	/// Writes collected output as JSON lines.
	pub fn write_to(&self, mut out: impl Write) -> anyhow::Result<()> {
		for line in &self.output {
			serde_json::to_writer(&mut out, line)?;
			writeln!(out)?;
		}
		Ok(())
	}

	pub async fn finish(self) {
		self.session.shutdown().await;
	}
}
