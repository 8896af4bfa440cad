// SPDX-License-Identifier: GPL-3.0-only

//! The arbitration engine: a single actor task owning every disk and
//! session, serializing mutating requests per disk, and driving external
//! phases through spawned jobs that report back over the engine channel.
//!
//! All state mutation happens on the engine task. External commands,
//! probes, and interactive rights checks run in spawned tasks and post
//! their results back as messages; callers observe completion through a
//! oneshot that resolves exactly once per request.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use enumflags2::BitFlags;
use tokio::sync::{mpsc, oneshot};

use arbiter_sys::CommandRunner;
use arbiter_types::{
    ArbiterError, CallbackKind, CallbackToken, Dissenter, DiskEvent, DiskId, DiskOption,
    DiskSnapshot, DiskStage, OperationFlags, Request, RequestId, RequestKind, RoundId, SessionId,
    keys,
};

use crate::authorize::{Authorizer, required_right};
use crate::disk::{ClaimHolder, DevicePropertyTable, Disk};
use crate::driver::{FileSystemDriver, ProbeOutcome};
use crate::personality::{Personality, PersonalityRegistry};
use crate::session::{CallbackSpec, CallerIdentity, Session};

/// Engine-wide policy knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Group whose members are implicitly authorized.
    pub admin_group: String,
    /// Historical bypass: treat sessions that presented no rights handle
    /// as authorized. Off unless explicitly enabled.
    pub allow_sessions_without_rights: bool,
    /// Stage a mount automatically after a successful probe.
    pub auto_mount: bool,
    /// Directory auto-mount targets are created under.
    pub mount_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_group: "wheel".to_string(),
            allow_sessions_without_rights: false,
            auto_mount: false,
            mount_root: PathBuf::from("/media"),
        }
    }
}

/// Output of one external phase, posted back to the engine task.
enum PhaseOutput {
    Probe {
        outcome: ProbeOutcome,
        personality: Arc<Personality>,
    },
    /// Probe ran but no personality recognized the device.
    NoMatch,
    Mounted {
        mountpoint: PathBuf,
    },
    Done,
}

enum EngineMsg {
    Connect {
        caller: CallerIdentity,
        has_rights: bool,
        events: mpsc::UnboundedSender<DiskEvent>,
        reply: oneshot::Sender<SessionId>,
    },
    Disconnect {
        session: SessionId,
    },
    Register {
        session: SessionId,
        spec: CallbackSpec,
        reply: oneshot::Sender<Result<CallbackToken, ArbiterError>>,
    },
    Unregister {
        session: SessionId,
        token: Option<CallbackToken>,
        context: Option<String>,
    },
    Submit {
        session: Option<SessionId>,
        request: Request,
        completion: oneshot::Sender<Option<Dissenter>>,
    },
    Respond {
        session: SessionId,
        round: RoundId,
        token: CallbackToken,
        dissent: Option<Dissenter>,
    },
    SetOptions {
        session: SessionId,
        disk: DiskId,
        options: BitFlags<DiskOption>,
        enable: bool,
        completion: oneshot::Sender<Option<Dissenter>>,
    },
    ListDisks {
        reply: oneshot::Sender<Vec<DiskSnapshot>>,
    },
    DeviceAppeared {
        properties: DevicePropertyTable,
    },
    DeviceDisappeared {
        id: DiskId,
    },
    AuthDecided {
        disk: DiskId,
        request: RequestId,
        allowed: bool,
    },
    PhaseDone {
        disk: DiskId,
        request: RequestId,
        result: Result<PhaseOutput, ArbiterError>,
    },
}

struct PendingRequest {
    id: RequestId,
    kind: RequestKind,
    /// `None` marks an engine-internal request (probe, auto-mount).
    session: Option<SessionId>,
    flags: BitFlags<OperationFlags>,
    arg1: Option<String>,
    arg2: Option<String>,
    completion: Option<oneshot::Sender<Option<Dissenter>>>,
}

struct DiskState {
    disk: Disk,
    active: Option<PendingRequest>,
    queue: VecDeque<PendingRequest>,
    appeared: bool,
}

struct RoundState {
    disk: DiskId,
    request: RequestId,
    kind: CallbackKind,
    remaining: VecDeque<(SessionId, CallbackToken)>,
    waiting_on: Option<(SessionId, CallbackToken)>,
}

pub struct ArbitrationEngine {
    config: EngineConfig,
    personalities: Arc<PersonalityRegistry>,
    driver: FileSystemDriver,
    authorizer: Arc<dyn Authorizer>,
    disks: BTreeMap<DiskId, DiskState>,
    sessions: BTreeMap<SessionId, Session>,
    rounds: HashMap<RoundId, RoundState>,
    next_registration: u64,
    was_idle: bool,
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl ArbitrationEngine {
    fn new(
        config: EngineConfig,
        personalities: PersonalityRegistry,
        authorizer: Arc<dyn Authorizer>,
        tx: mpsc::UnboundedSender<EngineMsg>,
    ) -> Self {
        let runner = Arc::new(CommandRunner::new());
        Self {
            config,
            personalities: Arc::new(personalities),
            driver: FileSystemDriver::new(runner),
            authorizer,
            disks: BTreeMap::new(),
            sessions: BTreeMap::new(),
            rounds: HashMap::new(),
            next_registration: 0,
            was_idle: true,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(message) = rx.recv().await {
            self.handle(message);
        }
        tracing::debug!("engine channel closed, shutting down");
    }

    fn handle(&mut self, message: EngineMsg) {
        match message {
            EngineMsg::Connect {
                caller,
                has_rights,
                events,
                reply,
            } => {
                let id = SessionId::new();
                tracing::debug!("session {id} connected (uid {}, pid {})", caller.uid, caller.pid);
                self.sessions
                    .insert(id, Session::new(id, caller, has_rights, events));
                let _ = reply.send(id);
            }
            EngineMsg::Disconnect { session } => self.disconnect(session),
            EngineMsg::Register {
                session,
                spec,
                reply,
            } => {
                let result = match self.sessions.get_mut(&session) {
                    Some(session) => {
                        let registration = self.next_registration;
                        self.next_registration += 1;
                        Ok(session.register(spec, registration))
                    }
                    None => Err(ArbiterError::bad_argument("unknown session")),
                };
                let _ = reply.send(result);
            }
            EngineMsg::Unregister {
                session,
                token,
                context,
            } => {
                if let Some(session) = self.sessions.get_mut(&session) {
                    if let Some(token) = token {
                        session.unregister(token);
                    }
                    if let Some(context) = &context {
                        session.unregister_context(context);
                    }
                }
            }
            EngineMsg::Submit {
                session,
                request,
                completion,
            } => self.submit(session, request, completion),
            EngineMsg::Respond {
                session,
                round,
                token,
                dissent,
            } => self.respond(session, round, token, dissent),
            EngineMsg::SetOptions {
                session,
                disk,
                options,
                enable,
                completion,
            } => self.set_options(session, disk, options, enable, completion),
            EngineMsg::ListDisks { reply } => {
                let snapshots = self.disks.values().map(|state| state.disk.snapshot()).collect();
                let _ = reply.send(snapshots);
            }
            EngineMsg::DeviceAppeared { properties } => self.device_appeared(properties),
            EngineMsg::DeviceDisappeared { id } => self.device_disappeared(id),
            EngineMsg::AuthDecided {
                disk,
                request,
                allowed,
            } => self.auth_decided(disk, request, allowed),
            EngineMsg::PhaseDone {
                disk,
                request,
                result,
            } => self.phase_done(disk, request, result),
        }
    }

    // ---- request intake -------------------------------------------------

    fn submit(
        &mut self,
        session: Option<SessionId>,
        request: Request,
        completion: oneshot::Sender<Option<Dissenter>>,
    ) {
        if let Some(session) = session {
            if !self.sessions.contains_key(&session) {
                let _ = completion.send(Some(Dissenter::from_error(&ArbiterError::bad_argument(
                    "unknown session",
                ))));
                return;
            }
        }
        let Some(state) = self.disks.get_mut(&request.disk) else {
            let _ = completion.send(Some(Dissenter::from_error(&ArbiterError::not_found(
                format!("unknown disk {}", request.disk),
            ))));
            return;
        };

        self.was_idle = false;
        state.queue.push_back(PendingRequest {
            id: RequestId::new(),
            kind: request.kind,
            session,
            flags: request.flags,
            arg1: request.arg1,
            arg2: request.arg2,
            completion: Some(completion),
        });
        let disk = request.disk;
        self.pump(&disk);
    }

    /// Advance a disk's queue: at most one request is active per disk, and
    /// its external phase must finish before the next request starts.
    fn pump(&mut self, disk: &DiskId) {
        let Some(state) = self.disks.get_mut(disk) else {
            return;
        };
        if state.active.is_some() {
            return;
        }
        let Some(request) = state.queue.pop_front() else {
            if state.disk.pending_removal {
                self.finalize_removal(disk.clone());
            } else {
                self.check_idle();
            }
            return;
        };

        state.disk.busy_since = Some(Utc::now());
        state.active = Some(request);
        self.authorize_active(disk.clone());
    }

    fn authorize_active(&mut self, disk: DiskId) {
        let (request_id, kind, session_id) = {
            let Some(state) = self.disks.get(&disk) else {
                return;
            };
            let Some(active) = state.active.as_ref() else {
                return;
            };
            (active.id, active.kind, active.session)
        };

        // Engine-internal requests and queue-level kinds skip rights.
        let (Some(right), Some(session_id)) = (required_right(kind), session_id) else {
            self.begin_approvals(disk);
            return;
        };
        let Some(session) = self.sessions.get(&session_id) else {
            self.fail_active(&disk, ArbiterError::bad_argument("session disconnected"));
            return;
        };
        let caller = session.caller;
        let Some(state) = self.disks.get(&disk) else {
            return;
        };
        let local = self.decide_local(session, &state.disk);

        match local {
            Some(true) => {
                if let Some(state) = self.disks.get_mut(&disk) {
                    state.disk.completed |= DiskStage::Authorize;
                }
                self.begin_approvals(disk);
            }
            Some(false) => {
                self.fail_active(&disk, ArbiterError::not_privileged("caller is not permitted"));
            }
            None => {
                // Interactive rights check off the engine task.
                if let Some(state) = self.disks.get_mut(&disk) {
                    state.disk.staged |= DiskStage::Authorize;
                }
                let authorizer = Arc::clone(&self.authorizer);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let allowed = authorizer.check(&caller, right).await.unwrap_or(false);
                    let _ = tx.send(EngineMsg::AuthDecided {
                        disk,
                        request: request_id,
                        allowed,
                    });
                });
            }
        }
    }

    /// Local authorization decision; `None` defers to the interactive
    /// rights check.
    fn decide_local(&self, session: &Session, disk: &Disk) -> Option<bool> {
        let caller = &session.caller;
        if caller.uid == 0 {
            return Some(true);
        }
        if crate::authorize::is_admin_group_member(caller, &self.config.admin_group) {
            return Some(true);
        }
        if disk.owner.uid == caller.uid {
            return Some(true);
        }
        if disk.owner.uid == arbiter_types::UID_UNKNOWN && disk.is_removable_media() {
            return Some(true);
        }
        if !session.has_rights {
            return Some(self.config.allow_sessions_without_rights);
        }
        None
    }

    fn auth_decided(&mut self, disk: DiskId, request: RequestId, allowed: bool) {
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        // Stale decision for a request that already completed.
        if state.active.as_ref().map(|active| active.id) != Some(request) {
            return;
        }
        if allowed {
            state.disk.completed |= DiskStage::Authorize;
            self.begin_approvals(disk);
        } else {
            self.fail_active(&disk, ArbiterError::not_privileged("authorization denied"));
        }
    }

    // ---- approval rounds ------------------------------------------------

    fn approval_kind(kind: RequestKind) -> Option<CallbackKind> {
        match kind {
            RequestKind::Mount => Some(CallbackKind::MountApproval),
            RequestKind::Unmount => Some(CallbackKind::UnmountApproval),
            RequestKind::Eject => Some(CallbackKind::EjectApproval),
            _ => None,
        }
    }

    fn begin_approvals(&mut self, disk: DiskId) {
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        let Some(active) = state.active.as_ref() else {
            return;
        };

        if active.kind == RequestKind::Claim {
            self.begin_claim(disk);
            return;
        }

        let Some(kind) = Self::approval_kind(active.kind) else {
            self.start_execution(disk);
            return;
        };

        state.disk.staged |= DiskStage::Approve;
        let request = active.id;
        let targets = self.ordered_targets(&disk, kind);
        if targets.is_empty() {
            if let Some(state) = self.disks.get_mut(&disk) {
                state.disk.completed |= DiskStage::Approve;
            }
            self.start_execution(disk);
            return;
        }

        let round_id = RoundId::new();
        self.rounds.insert(
            round_id,
            RoundState {
                disk: disk.clone(),
                request,
                kind,
                remaining: targets.into(),
                waiting_on: None,
            },
        );
        self.advance_round(round_id);
    }

    /// Decision callbacks for `kind` across every session, in
    /// (order, registration) dispatch order.
    fn ordered_targets(&self, disk: &DiskId, kind: CallbackKind) -> Vec<(SessionId, CallbackToken)> {
        let Some(state) = self.disks.get(disk) else {
            return Vec::new();
        };
        let mut targets: Vec<(i32, u64, SessionId, CallbackToken)> = Vec::new();
        for session in self.sessions.values() {
            for callback in session.ordered_callbacks(kind) {
                if callback.wants(&state.disk, None) {
                    targets.push((
                        callback.order,
                        callback.registration,
                        session.id(),
                        callback.token,
                    ));
                }
            }
        }
        targets.sort_by_key(|(order, registration, _, _)| (*order, *registration));
        targets
            .into_iter()
            .map(|(_, _, session, token)| (session, token))
            .collect()
    }

    /// Dispatch the next callback of a round, or finish the round with no
    /// objection when none remain.
    fn advance_round(&mut self, round_id: RoundId) {
        loop {
            let Some(round) = self.rounds.get_mut(&round_id) else {
                return;
            };
            let Some((session_id, token)) = round.remaining.pop_front() else {
                let round = self.rounds.remove(&round_id).expect("round exists");
                self.round_finished(round, None);
                return;
            };

            let Some(state) = self.disks.get(&round.disk) else {
                self.rounds.remove(&round_id);
                return;
            };
            let snapshot = state.disk.snapshot();
            let kind = round.kind;
            let event = match kind {
                CallbackKind::ClaimRelease => DiskEvent::ClaimReleaseRequested {
                    round: round_id,
                    token,
                    disk: snapshot,
                },
                _ => DiskEvent::ApprovalRequested {
                    round: round_id,
                    token,
                    kind,
                    disk: snapshot,
                },
            };
            let delivered = self
                .sessions
                .get(&session_id)
                .is_some_and(|session| session.send(event));
            if delivered {
                round.waiting_on = Some((session_id, token));
                return;
            }
            // Dead or missing session: its vote is no objection.
        }
    }

    fn respond(
        &mut self,
        session: SessionId,
        round_id: RoundId,
        token: CallbackToken,
        dissent: Option<Dissenter>,
    ) {
        let Some(round) = self.rounds.get(&round_id) else {
            return;
        };
        // At most one vote per dispatched callback, from the session and
        // callback the round is waiting on; anything else is dropped.
        if round.waiting_on != Some((session, token)) {
            return;
        }
        match dissent {
            Some(dissenter) => {
                let round = self.rounds.remove(&round_id).expect("round exists");
                self.round_finished(round, Some(dissenter));
            }
            None => self.advance_round(round_id),
        }
    }

    fn round_finished(&mut self, round: RoundState, dissent: Option<Dissenter>) {
        let disk = round.disk.clone();
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        if state.active.as_ref().map(|active| active.id) != Some(round.request) {
            return;
        }

        if round.kind == CallbackKind::ClaimRelease {
            match dissent {
                // The holder objects to releasing: the new claim loses.
                Some(dissenter) => self.complete_active(&disk, Some(dissenter)),
                None => {
                    state.disk.release_claim();
                    self.install_claim(disk);
                }
            }
            return;
        }

        match dissent {
            Some(dissenter) => self.complete_active(&disk, Some(dissenter)),
            None => {
                state.disk.completed |= DiskStage::Approve;
                self.start_execution(disk);
            }
        }
    }

    // ---- claims ---------------------------------------------------------

    fn begin_claim(&mut self, disk: DiskId) {
        let Some(state) = self.disks.get(&disk) else {
            return;
        };
        let Some(active) = state.active.as_ref() else {
            return;
        };
        let request = active.id;

        match state.disk.claim_holder() {
            None => self.install_claim(disk),
            Some(holder) => {
                // Consult the holder's release callback; without one the
                // claim is simply busy.
                let Some(token) = holder.callback else {
                    self.fail_active(
                        &disk,
                        ArbiterError::busy(format!("disk {disk} is already claimed")),
                    );
                    return;
                };
                let holder_session = holder.session;
                if self
                    .sessions
                    .get(&holder_session)
                    .and_then(|session| session.find_callback(token))
                    .is_none()
                {
                    self.fail_active(
                        &disk,
                        ArbiterError::busy(format!("disk {disk} is already claimed")),
                    );
                    return;
                }
                let round_id = RoundId::new();
                self.rounds.insert(
                    round_id,
                    RoundState {
                        disk,
                        request,
                        kind: CallbackKind::ClaimRelease,
                        remaining: VecDeque::from([(holder_session, token)]),
                        waiting_on: None,
                    },
                );
                self.advance_round(round_id);
            }
        }
    }

    fn install_claim(&mut self, disk: DiskId) {
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        let Some(active) = state.active.as_ref() else {
            return;
        };
        let Some(session_id) = active.session else {
            self.fail_active(&disk, ArbiterError::bad_argument("claim without session"));
            return;
        };
        let callback = self
            .sessions
            .get(&session_id)
            .and_then(|session| session.first_of_kind(CallbackKind::ClaimRelease))
            .map(|callback| callback.token);

        let result = state.disk.claim(ClaimHolder {
            session: session_id,
            callback,
        });
        match result {
            Ok(()) => {
                let snapshot = state.disk.snapshot();
                self.broadcast(CallbackKind::Claim, &disk, DiskEvent::Claimed(snapshot));
                self.complete_active(&disk, None);
            }
            Err(error) => self.fail_active(&disk, error),
        }
    }

    // ---- execution ------------------------------------------------------

    fn start_execution(&mut self, disk: DiskId) {
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        let Some(active) = state.active.as_ref() else {
            return;
        };
        let request = active.id;
        let kind = active.kind;
        let flags = active.flags;
        let arg1 = active.arg1.clone();
        let arg2 = active.arg2.clone();
        let session = active.session;

        match kind {
            RequestKind::Claim => unreachable!("claims never reach execution"),
            RequestKind::Release => {
                let holder = state.disk.claim_holder().cloned();
                match holder {
                    Some(holder) if Some(holder.session) == session => {
                        state.disk.release_claim();
                        self.complete_active(&disk, None);
                    }
                    Some(_) => self.fail_active(
                        &disk,
                        ArbiterError::bad_argument("caller does not hold the claim"),
                    ),
                    None => self.fail_active(&disk, ArbiterError::bad_argument("disk not claimed")),
                }
            }
            RequestKind::Refresh => {
                let changed: Vec<String> =
                    state.disk.description().keys().map(str::to_string).collect();
                self.notify_description_changed(&disk, changed);
                self.complete_active(&disk, None);
            }
            RequestKind::Probe => {
                state.disk.staged |= DiskStage::Probe;
                let candidates = self.personalities.candidates(state.disk.description());
                let device = PathBuf::from(state.disk.id().as_str());
                let driver = self.driver.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let mut result = Ok(PhaseOutput::NoMatch);
                    for personality in candidates {
                        match driver.probe(&personality, &device).await {
                            Ok(outcome) => {
                                result = Ok(PhaseOutput::Probe {
                                    outcome,
                                    personality,
                                });
                                break;
                            }
                            Err(error) => {
                                tracing::debug!(
                                    "personality `{}` did not match {}: {error}",
                                    personality.name,
                                    device.display()
                                );
                            }
                        }
                    }
                    let _ = tx.send(EngineMsg::PhaseDone {
                        disk,
                        request,
                        result,
                    });
                });
            }
            RequestKind::Mount => {
                let Some(personality) = state.disk.personality.clone() else {
                    self.fail_active(
                        &disk,
                        ArbiterError::unsupported(format!("no filesystem recognized on {disk}")),
                    );
                    return;
                };
                state.disk.staged |= DiskStage::Mount;
                let device = PathBuf::from(state.disk.id().as_str());
                let mountpoint = match self.resolve_mountpoint(&disk, arg1.as_deref()) {
                    Ok(mountpoint) => mountpoint,
                    Err(error) => {
                        self.fail_active(&disk, error);
                        return;
                    }
                };
                let options: Vec<String> = arg2
                    .as_deref()
                    .map(|options| options.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                let run_as = self.run_as_owner(&disk);
                let driver = self.driver.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = async {
                        tokio::fs::create_dir_all(&mountpoint).await.map_err(|error| {
                            ArbiterError::io_failure(format!(
                                "cannot create mountpoint {}: {error}",
                                mountpoint.display()
                            ))
                        })?;
                        driver
                            .mount(&personality, &device, &mountpoint, &options, run_as)
                            .await?;
                        Ok(PhaseOutput::Mounted { mountpoint })
                    }
                    .await;
                    let _ = tx.send(EngineMsg::PhaseDone {
                        disk,
                        request,
                        result,
                    });
                });
            }
            RequestKind::Unmount => {
                let Some(mountpoint) = state.disk.description().volume_path().map(PathBuf::from)
                else {
                    self.fail_active(
                        &disk,
                        ArbiterError::bad_argument(format!("{disk} is not mounted")),
                    );
                    return;
                };
                let force = flags.contains(OperationFlags::Force);
                let driver = self.driver.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = driver
                        .unmount(&mountpoint, force)
                        .await
                        .map(|_| PhaseOutput::Done);
                    let _ = tx.send(EngineMsg::PhaseDone {
                        disk,
                        request,
                        result,
                    });
                });
            }
            RequestKind::Eject => {
                let device = PathBuf::from(state.disk.id().as_str());
                let run_as = self.run_as_owner(&disk);
                let runner = Arc::clone(self.driver.runner());
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = match arbiter_sys::eject_spec(&device, run_as) {
                        Ok(spec) => {
                            let outcome = runner.execute(spec).await;
                            if outcome.success() {
                                Ok(PhaseOutput::Done)
                            } else {
                                Err(ArbiterError::io_failure(format!(
                                    "eject of {} failed with status {}",
                                    device.display(),
                                    outcome.status
                                )))
                            }
                        }
                        Err(error) => Err(ArbiterError::unsupported(error.to_string())),
                    };
                    let _ = tx.send(EngineMsg::PhaseDone {
                        disk,
                        request,
                        result,
                    });
                });
            }
            RequestKind::Rename => {
                let Some(personality) = state.disk.personality.clone() else {
                    self.fail_active(
                        &disk,
                        ArbiterError::unsupported(format!("no filesystem recognized on {disk}")),
                    );
                    return;
                };
                let Some(name) = arg1 else {
                    self.fail_active(&disk, ArbiterError::bad_argument("rename needs a name"));
                    return;
                };
                let device = PathBuf::from(state.disk.id().as_str());
                let driver = self.driver.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = driver
                        .rename(&personality, &device, &name)
                        .await
                        .map(|_| PhaseOutput::Done);
                    let _ = tx.send(EngineMsg::PhaseDone {
                        disk,
                        request,
                        result,
                    });
                });
            }
        }
    }

    /// Auto-mount targets land under the mount root; relative caller paths
    /// are resolved to absolute form before use.
    fn resolve_mountpoint(
        &self,
        disk: &DiskId,
        requested: Option<&str>,
    ) -> Result<PathBuf, ArbiterError> {
        if let Some(requested) = requested {
            let path = Path::new(requested);
            return if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::path::absolute(path).map_err(|error| {
                    ArbiterError::bad_argument(format!("bad mountpoint {requested}: {error}"))
                })
            };
        }
        let state = self
            .disks
            .get(disk)
            .ok_or_else(|| ArbiterError::not_found(format!("unknown disk {disk}")))?;
        let leaf = state
            .disk
            .description()
            .volume_name()
            .map(str::to_string)
            .unwrap_or_else(|| {
                disk.as_str()
                    .rsplit('/')
                    .next()
                    .unwrap_or("volume")
                    .to_string()
            });
        Ok(self.config.mount_root.join(leaf))
    }

    fn run_as_owner(&self, disk: &DiskId) -> Option<(u32, u32)> {
        let state = self.disks.get(disk)?;
        let owner = state.disk.owner;
        if owner.uid == arbiter_types::UID_UNKNOWN {
            None
        } else {
            Some((owner.uid, owner.gid))
        }
    }

    // ---- phase completion -----------------------------------------------

    fn phase_done(
        &mut self,
        disk: DiskId,
        request: RequestId,
        result: Result<PhaseOutput, ArbiterError>,
    ) {
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        if state.active.as_ref().map(|active| active.id) != Some(request) {
            return;
        }
        let kind = state.active.as_ref().map(|active| active.kind);

        match result {
            Ok(PhaseOutput::Probe {
                outcome,
                personality,
            }) => {
                state.disk.completed |= DiskStage::Probe;
                if outcome.clean.is_some() {
                    state.disk.completed |= DiskStage::Repair;
                }
                state.disk.personality = Some(personality);
                let mut changed = Vec::new();
                {
                    let description = state.disk.description_mut();
                    if description.set(keys::VOLUME_KIND, outcome.volume_kind.clone()) {
                        changed.push(keys::VOLUME_KIND.to_string());
                    }
                    if let Some(name) = &outcome.volume_name {
                        if description.set(keys::VOLUME_NAME, name.clone()) {
                            changed.push(keys::VOLUME_NAME.to_string());
                        }
                    }
                    if let Some(uuid) = outcome.volume_uuid {
                        if description.set(keys::VOLUME_UUID, uuid.to_string()) {
                            changed.push(keys::VOLUME_UUID.to_string());
                        }
                    }
                }
                if state.appeared && !changed.is_empty() {
                    self.notify_description_changed(&disk, changed);
                }
                // Announce before completing so a staged auto-mount is
                // queued ahead of the idle check.
                self.after_probe(disk.clone());
                self.complete_active(&disk, None);
            }
            Ok(PhaseOutput::NoMatch) => {
                state.disk.completed |= DiskStage::Probe;
                self.after_probe(disk.clone());
                self.complete_active(&disk, None);
            }
            Ok(PhaseOutput::Mounted { mountpoint }) => {
                state.disk.completed |= DiskStage::Mount;
                let changed = state
                    .disk
                    .description_mut()
                    .set(keys::VOLUME_PATH, mountpoint.display().to_string());
                if changed {
                    self.notify_description_changed(&disk, vec![keys::VOLUME_PATH.to_string()]);
                }
                self.complete_active(&disk, None);
            }
            Ok(PhaseOutput::Done) => {
                match kind {
                    Some(RequestKind::Unmount) => {
                        if state.disk.description_mut().remove(keys::VOLUME_PATH) {
                            state.disk.completed.remove(DiskStage::Mount);
                            state.disk.staged.remove(DiskStage::Mount);
                            self.notify_description_changed(
                                &disk,
                                vec![keys::VOLUME_PATH.to_string()],
                            );
                        }
                    }
                    Some(RequestKind::Rename) => {
                        let name = state
                            .active
                            .as_ref()
                            .and_then(|active| active.arg1.clone());
                        if let Some(name) = name {
                            if state.disk.description_mut().set(keys::VOLUME_NAME, name) {
                                self.notify_description_changed(
                                    &disk,
                                    vec![keys::VOLUME_NAME.to_string()],
                                );
                            }
                        }
                    }
                    _ => {}
                }
                self.complete_active(&disk, None);
            }
            Err(error) => {
                self.complete_active(&disk, Some(Dissenter::from_error(&error)));
            }
        }
    }

    /// First-probe epilogue: announce the disk, run the peek pass, and
    /// stage an auto-mount when policy asks for one.
    fn after_probe(&mut self, disk: DiskId) {
        let Some(state) = self.disks.get_mut(&disk) else {
            return;
        };
        if state.appeared {
            return;
        }
        state.appeared = true;
        if self.config.auto_mount && state.disk.description().is_removable() {
            state.disk.options |= DiskOption::AutoMount;
        }
        let snapshot = state.disk.snapshot();
        let has_personality = state.disk.personality.is_some();
        let auto_mount = state.disk.options.contains(DiskOption::AutoMount);

        self.broadcast(CallbackKind::DiskAppeared, &disk, DiskEvent::Appeared(snapshot.clone()));
        self.broadcast(CallbackKind::DiskClassic, &disk, DiskEvent::Appeared(snapshot.clone()));

        // Peek pass: ordered, cannot veto.
        if let Some(state) = self.disks.get_mut(&disk) {
            state.disk.staged |= DiskStage::Peek;
        }
        for (session_id, _token) in self.ordered_targets(&disk, CallbackKind::Peek) {
            if let Some(session) = self.sessions.get(&session_id) {
                session.send(DiskEvent::Peek(snapshot.clone()));
            }
        }
        if let Some(state) = self.disks.get_mut(&disk) {
            state.disk.completed |= DiskStage::Peek;
        }

        if auto_mount && has_personality {
            let (completion, _discarded) = oneshot::channel();
            self.submit(
                None,
                Request::new(RequestKind::Mount, disk),
                completion,
            );
        }
    }

    fn complete_active(&mut self, disk: &DiskId, dissent: Option<Dissenter>) {
        let Some(state) = self.disks.get_mut(disk) else {
            return;
        };
        let Some(mut active) = state.active.take() else {
            return;
        };
        state.disk.busy_since = None;
        if let Some(completion) = active.completion.take() {
            let _ = completion.send(dissent);
        }
        self.pump(disk);
    }

    fn fail_active(&mut self, disk: &DiskId, error: ArbiterError) {
        tracing::debug!("request on {disk} failed: {error}");
        self.complete_active(disk, Some(Dissenter::from_error(&error)));
    }

    // ---- options --------------------------------------------------------

    fn set_options(
        &mut self,
        session: SessionId,
        disk: DiskId,
        options: BitFlags<DiskOption>,
        enable: bool,
        completion: oneshot::Sender<Option<Dissenter>>,
    ) {
        let allowed = self
            .sessions
            .get(&session)
            .map(|session| {
                session.caller.uid == 0
                    || crate::authorize::is_admin_group_member(
                        &session.caller,
                        &self.config.admin_group,
                    )
            })
            .unwrap_or(false);
        if !allowed {
            let _ = completion.send(Some(Dissenter::from_error(
                &ArbiterError::not_privileged("setting disk options requires privilege"),
            )));
            return;
        }
        let Some(state) = self.disks.get_mut(&disk) else {
            let _ = completion.send(Some(Dissenter::from_error(&ArbiterError::not_found(
                format!("unknown disk {disk}"),
            ))));
            return;
        };
        if enable {
            state.disk.options |= options;
        } else {
            state.disk.options.remove(options);
        }
        let _ = completion.send(None);
    }

    // ---- device lifecycle -----------------------------------------------

    fn device_appeared(&mut self, properties: DevicePropertyTable) {
        let disk = match Disk::from_device_properties(properties) {
            Ok(disk) => disk,
            Err(error) => {
                tracing::warn!("ignoring device: {error}");
                return;
            }
        };
        let id = disk.id().clone();
        if self.disks.contains_key(&id) {
            tracing::debug!("device {id} re-announced, ignoring");
            return;
        }
        tracing::info!("disk {id} attached");
        self.was_idle = false;
        self.disks.insert(
            id.clone(),
            DiskState {
                disk,
                active: None,
                queue: VecDeque::new(),
                appeared: false,
            },
        );

        let (completion, _discarded) = oneshot::channel();
        self.submit(None, Request::new(RequestKind::Probe, id), completion);
    }

    fn device_disappeared(&mut self, id: DiskId) {
        let Some(state) = self.disks.get_mut(&id) else {
            return;
        };
        if state.active.is_some() || !state.queue.is_empty() || state.disk.busy_since.is_some() {
            // Children/operations still settling; defer the notification.
            tracing::debug!("deferring removal of busy disk {id}");
            state.disk.pending_removal = true;
            return;
        }
        self.finalize_removal(id);
    }

    fn finalize_removal(&mut self, id: DiskId) {
        let Some(mut state) = self.disks.remove(&id) else {
            return;
        };
        // Anything still queued can no longer run.
        for mut request in state.queue.drain(..) {
            if let Some(completion) = request.completion.take() {
                let _ = completion.send(Some(Dissenter::from_error(&ArbiterError::not_found(
                    format!("disk {id} is gone"),
                ))));
            }
        }
        tracing::info!("disk {id} detached");
        let snapshot = state.disk.snapshot();
        self.broadcast_with(CallbackKind::DiskDisappeared, &state.disk, None, |_| {
            DiskEvent::Disappeared(snapshot.clone())
        });
        self.broadcast_with(CallbackKind::DiskClassic, &state.disk, None, |_| {
            DiskEvent::Disappeared(snapshot.clone())
        });
        self.check_idle();
    }

    // ---- notification ---------------------------------------------------

    fn notify_description_changed(&self, disk: &DiskId, changed: Vec<String>) {
        let Some(state) = self.disks.get(disk) else {
            return;
        };
        let snapshot = state.disk.snapshot();
        for kind in [CallbackKind::DiskDescriptionChanged, CallbackKind::DiskClassic] {
            self.broadcast_with(kind, &state.disk, Some(&changed), |_| {
                DiskEvent::DescriptionChanged {
                    disk: snapshot.clone(),
                    changed_keys: changed.clone(),
                }
            });
        }
    }

    fn broadcast(&self, kind: CallbackKind, disk: &DiskId, event: DiskEvent) {
        let Some(state) = self.disks.get(disk) else {
            return;
        };
        self.broadcast_with(kind, &state.disk, None, |_| event.clone());
    }

    /// Deliver one event per matching callback, in registration order.
    fn broadcast_with<F>(
        &self,
        kind: CallbackKind,
        disk: &Disk,
        changed: Option<&[String]>,
        event: F,
    ) where
        F: Fn(CallbackToken) -> DiskEvent,
    {
        for session in self.sessions.values() {
            for callback in session.ordered_callbacks(kind) {
                if callback.wants(disk, changed) {
                    session.send(event(callback.token));
                }
            }
        }
    }

    fn check_idle(&mut self) {
        if self.was_idle {
            return;
        }
        let busy = self
            .disks
            .values()
            .any(|state| state.active.is_some() || !state.queue.is_empty());
        if busy {
            return;
        }
        self.was_idle = true;
        for session in self.sessions.values() {
            if !session.ordered_callbacks(CallbackKind::Idle).is_empty() {
                session.send(DiskEvent::Idle);
            }
        }
    }

    // ---- sessions -------------------------------------------------------

    fn disconnect(&mut self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_none() {
            return;
        }
        tracing::debug!("session {session_id} disconnected");

        // A claim dies with its holder.
        let claimed: Vec<DiskId> = self
            .disks
            .iter()
            .filter(|(_, state)| {
                state
                    .disk
                    .claim_holder()
                    .is_some_and(|holder| holder.session == session_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in claimed {
            if let Some(state) = self.disks.get_mut(&id) {
                state.disk.release_claim();
            }
        }

        // Rounds waiting on the session advance as if it had no objection.
        let waiting: Vec<RoundId> = self
            .rounds
            .iter()
            .filter(|(_, round)| {
                round
                    .waiting_on
                    .is_some_and(|(waiting, _)| waiting == session_id)
            })
            .map(|(id, _)| *id)
            .collect();
        for round in waiting {
            self.advance_round(round);
        }
    }
}

/// Clonable entry point to a running engine.
#[derive(Clone)]
pub struct ArbitrationHandle {
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl ArbitrationHandle {
    /// Spawn the engine actor and return its handle.
    pub fn spawn(
        config: EngineConfig,
        personalities: PersonalityRegistry,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = ArbitrationEngine::new(config, personalities, authorizer, tx.clone());
        tokio::spawn(engine.run(rx));
        Self { tx }
    }

    /// Open a session for a caller. `has_rights` records whether the client
    /// presented an authorization capability.
    pub async fn connect(
        &self,
        caller: CallerIdentity,
        has_rights: bool,
    ) -> Result<SessionHandle, ArbiterError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Connect {
                caller,
                has_rights,
                events: events_tx,
                reply: reply_tx,
            })
            .map_err(|_| ArbiterError::io_failure("engine unavailable"))?;
        let id = reply_rx
            .await
            .map_err(|_| ArbiterError::io_failure("engine unavailable"))?;
        Ok(SessionHandle {
            id,
            tx: self.tx.clone(),
            events: events_rx,
        })
    }

    /// Feed a new device's property table into the engine.
    pub fn announce_device(&self, properties: DevicePropertyTable) {
        let _ = self.tx.send(EngineMsg::DeviceAppeared { properties });
    }

    /// Report a device as gone.
    pub fn withdraw_device(&self, id: DiskId) {
        let _ = self.tx.send(EngineMsg::DeviceDisappeared { id });
    }

    /// Snapshots of every tracked disk.
    pub async fn list_disks(&self) -> Vec<DiskSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(EngineMsg::ListDisks { reply: reply_tx }).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// One client's connection: operations plus the event stream.
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<EngineMsg>,
    events: mpsc::UnboundedReceiver<DiskEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn next_event(&mut self) -> Option<DiskEvent> {
        self.events.recv().await
    }

    pub fn try_event(&mut self) -> Option<DiskEvent> {
        self.events.try_recv().ok()
    }

    pub async fn register_callback(
        &self,
        spec: CallbackSpec,
    ) -> Result<CallbackToken, ArbiterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Register {
                session: self.id,
                spec,
                reply: reply_tx,
            })
            .map_err(|_| ArbiterError::io_failure("engine unavailable"))?;
        reply_rx
            .await
            .map_err(|_| ArbiterError::io_failure("engine unavailable"))?
    }

    pub fn unregister_callback(&self, token: CallbackToken) {
        let _ = self.tx.send(EngineMsg::Unregister {
            session: self.id,
            token: Some(token),
            context: None,
        });
    }

    /// Remove every callback registered under a context tag.
    pub fn unregister_context(&self, context: impl Into<String>) {
        let _ = self.tx.send(EngineMsg::Unregister {
            session: self.id,
            token: None,
            context: Some(context.into()),
        });
    }

    /// Answer an approval round for the callback named by `token`. At most
    /// the first answer per dispatched callback counts.
    pub fn respond(&self, round: RoundId, token: CallbackToken, dissent: Option<Dissenter>) {
        let _ = self.tx.send(EngineMsg::Respond {
            session: self.id,
            round,
            token,
            dissent,
        });
    }

    /// Queue a request and await its completion. The returned dissenter is
    /// `None` on success; the completion fires exactly once either way.
    pub async fn submit(&self, request: Request) -> Option<Dissenter> {
        let (completion_tx, completion_rx) = oneshot::channel();
        if self
            .tx
            .send(EngineMsg::Submit {
                session: Some(self.id),
                request,
                completion: completion_tx,
            })
            .is_err()
        {
            return Some(Dissenter::from_error(&ArbiterError::io_failure(
                "engine unavailable",
            )));
        }
        match completion_rx.await {
            Ok(dissent) => dissent,
            Err(_) => Some(Dissenter::from_error(&ArbiterError::io_failure(
                "engine dropped the request",
            ))),
        }
    }

    /// Bounded wait around [`submit`]: an elapsed timeout reports `Timeout`
    /// to this caller while the request keeps running server-side.
    pub async fn submit_with_timeout(
        &self,
        request: Request,
        wait: std::time::Duration,
    ) -> Option<Dissenter> {
        match tokio::time::timeout(wait, self.submit(request)).await {
            Ok(dissent) => dissent,
            Err(_) => Some(Dissenter::from_error(&ArbiterError::new(
                arbiter_types::ArbiterErrorKind::Timeout,
                "timed out waiting for completion",
            ))),
        }
    }

    pub async fn claim(&self, disk: &DiskId) -> Option<Dissenter> {
        self.submit(Request::new(RequestKind::Claim, disk.clone())).await
    }

    pub async fn release(&self, disk: &DiskId) -> Option<Dissenter> {
        self.submit(Request::new(RequestKind::Release, disk.clone())).await
    }

    /// Mount a disk. `options` tokens are joined into a single
    /// comma-separated argument for the mount tool.
    pub async fn mount(
        &self,
        disk: &DiskId,
        mountpoint: Option<&Path>,
        options: &[&str],
        flags: BitFlags<OperationFlags>,
    ) -> Option<Dissenter> {
        let mut request = Request::new(RequestKind::Mount, disk.clone()).with_flags(flags);
        if let Some(mountpoint) = mountpoint {
            request = request.with_arg1(mountpoint.display().to_string());
        }
        if !options.is_empty() {
            request = request.with_arg2(options.join(","));
        }
        self.submit(request).await
    }

    pub async fn unmount(
        &self,
        disk: &DiskId,
        flags: BitFlags<OperationFlags>,
    ) -> Option<Dissenter> {
        self.submit(Request::new(RequestKind::Unmount, disk.clone()).with_flags(flags))
            .await
    }

    pub async fn eject(&self, disk: &DiskId) -> Option<Dissenter> {
        self.submit(Request::new(RequestKind::Eject, disk.clone())).await
    }

    pub async fn rename(&self, disk: &DiskId, name: &str) -> Option<Dissenter> {
        self.submit(Request::new(RequestKind::Rename, disk.clone()).with_arg1(name))
            .await
    }

    pub async fn refresh(&self, disk: &DiskId) -> Option<Dissenter> {
        self.submit(Request::new(RequestKind::Refresh, disk.clone())).await
    }

    /// Set or clear persistent disk option bits; privileged callers only.
    pub async fn set_options(
        &self,
        disk: &DiskId,
        options: BitFlags<DiskOption>,
        enable: bool,
    ) -> Option<Dissenter> {
        let (completion_tx, completion_rx) = oneshot::channel();
        if self
            .tx
            .send(EngineMsg::SetOptions {
                session: self.id,
                disk: disk.clone(),
                options,
                enable,
                completion: completion_tx,
            })
            .is_err()
        {
            return Some(Dissenter::from_error(&ArbiterError::io_failure(
                "engine unavailable",
            )));
        }
        completion_rx.await.unwrap_or_else(|_| {
            Some(Dissenter::from_error(&ArbiterError::io_failure(
                "engine dropped the request",
            )))
        })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(EngineMsg::Disconnect { session: self.id });
    }
}
