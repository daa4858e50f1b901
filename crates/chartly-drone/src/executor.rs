// SPDX-License-Identifier: MIT OR Apache-2.0

//! The drone executor: registration, the iteration loop, and run reporting.

use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{ClientOptions, ControlPlaneClient};
use crate::config::{DroneConfig, parse_duration};
use crate::schedule::is_due;
use crate::shutdown::Shutdown;
use crate::wire::{ProfileEnvelope, ResultsRequest, Run, RunStatus};
use crate::{DroneError, truncate_error};

/// State machine: `new → registered → running → shutting_down`, driven by
/// [`Drone::register`] and [`Drone::run`].
#[derive(Debug)]
pub struct Drone {
    config: DroneConfig,
    client: ControlPlaneClient,
    assigned: Vec<String>,
    last_run: BTreeMap<String, chrono::DateTime<Utc>>,
}

impl Drone {
    /// Build a drone from its configuration.
    ///
    /// # Errors
    ///
    /// [`DroneError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: DroneConfig) -> Result<Self, DroneError> {
        let mut opts = ClientOptions::new(&config.control_plane, &config.user_agent);
        opts.api_key = config.registry_api_key.clone();
        let client = ControlPlaneClient::new(opts)?;
        Ok(Self::with_client(config, client))
    }

    /// Build a drone around an explicitly configured client (used by tests
    /// that point at local fixtures).
    #[must_use]
    pub fn with_client(config: DroneConfig, client: ControlPlaneClient) -> Self {
        Self {
            config,
            client,
            assigned: Vec::new(),
            last_run: BTreeMap::new(),
        }
    }

    /// Profile ids assigned at registration, in stable processing order.
    #[must_use]
    pub fn assigned_profiles(&self) -> &[String] {
        &self.assigned
    }

    /// Register with the control plane and record the assigned profiles.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures; registration failure is fatal to the
    /// process.
    pub async fn register(&mut self, shutdown: &Shutdown) -> Result<(), DroneError> {
        let response = self.client.register(shutdown, &self.config.drone_id).await?;
        self.assigned = response.assigned_profiles;
        info!(
            drone_id = %self.config.drone_id,
            profiles = self.assigned.len(),
            "registered with control plane"
        );
        Ok(())
    }

    /// Run iterations until shutdown; `once` stops after the first.
    ///
    /// Iteration errors are logged and never abort the loop.
    ///
    /// # Errors
    ///
    /// Currently none beyond cancellation; reserved for fatal conditions.
    pub async fn run(&mut self, shutdown: &Shutdown, once: bool) -> Result<(), DroneError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = self.iterate(shutdown).await {
                warn!(error = %e, "iteration finished with errors");
            }
            if once {
                return Ok(());
            }
            let mut waiter = shutdown.clone();
            tokio::select! {
                () = waiter.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.process_interval) => {}
            }
        }
    }

    /// One full iteration: forced-run fetch, per-profile execution, and a
    /// heartbeat. A failing profile never aborts the iteration; failures
    /// accumulate into a single [`DroneError::Iteration`].
    ///
    /// # Errors
    ///
    /// [`DroneError::Cancelled`] mid-shutdown, or the accumulated
    /// iteration error.
    pub async fn iterate(&mut self, shutdown: &Shutdown) -> Result<(), DroneError> {
        let mut errors: Vec<String> = Vec::new();

        let forced: Vec<String> = match self.client.work(shutdown, &self.config.drone_id).await {
            Ok(profiles) => profiles,
            Err(DroneError::Cancelled) => return Err(DroneError::Cancelled),
            Err(e) => {
                errors.push(format!("work queue: {e}"));
                Vec::new()
            }
        };

        let assigned = self.assigned.clone();
        for profile_id in &assigned {
            if shutdown.is_cancelled() {
                break;
            }
            let is_forced = forced.iter().any(|p| p == profile_id);
            if let Err(detail) = self.execute_profile(shutdown, profile_id, is_forced).await {
                errors.push(detail);
            }
        }

        if !shutdown.is_cancelled()
            && let Err(e) = self.client.heartbeat(shutdown, &self.config.drone_id).await
        {
            errors.push(format!("heartbeat: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DroneError::Iteration { details: errors })
        }
    }

    /// Execute one profile if it is due (or forced), reporting exactly one
    /// run per attempted execution. Returns a failure summary string for
    /// the iteration error on any per-profile failure.
    async fn execute_profile(
        &mut self,
        shutdown: &Shutdown,
        profile_id: &str,
        forced: bool,
    ) -> Result<(), String> {
        let profile = match self.client.profile(shutdown, profile_id).await {
            Ok(profile) => profile,
            Err(e) => return Err(format!("{profile_id}: fetch profile: {e}")),
        };

        if !forced {
            if profile.enabled == Some(false) {
                return Ok(());
            }
            if !self.profile_is_due(&profile) {
                return Ok(());
            }
        }

        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        self.last_run.insert(profile_id.to_string(), started_at);

        let outcome = self.run_pipeline(shutdown, &profile, &run_id).await;
        let (status, rows_out, error) = match outcome {
            Ok(rows) => (RunStatus::Succeeded, rows, None),
            Err(ProfileFailure::Partial { rows, detail }) => {
                (RunStatus::Partial, rows, Some(detail))
            }
            Err(ProfileFailure::Failed { detail }) => (RunStatus::Failed, 0, Some(detail)),
        };

        let run = Run::new(
            run_id,
            self.config.drone_id.clone(),
            profile_id.to_string(),
            started_at,
            Utc::now(),
            status,
            rows_out,
            error.clone(),
        );
        info!(profile_id, status = ?status, rows_out, "profile executed");

        let mut failure = error.map(|e| format!("{profile_id}: {e}"));
        if let Err(e) = self.client.post_run(shutdown, &run).await {
            let detail = format!("{profile_id}: post run: {e}");
            failure = Some(match failure {
                Some(existing) => format!("{existing}; {detail}"),
                None => detail,
            });
        }
        match failure {
            Some(detail) => Err(detail),
            None => Ok(()),
        }
    }

    /// Fetch, map, and deliver one profile's records.
    async fn run_pipeline(
        &self,
        shutdown: &Shutdown,
        profile: &ProfileEnvelope,
        run_id: &str,
    ) -> Result<u64, ProfileFailure> {
        let content = chartly_pipeline::ProfileContent::from_yaml(&profile.content)
            .map_err(|e| ProfileFailure::failed(truncate_error(&e.to_string())))?;

        let raw = self
            .client
            .fetch_source(shutdown, &content.source.url)
            .await
            .map_err(|e| ProfileFailure::failed(truncate_error(&format!("fetch: {e}"))))?;

        let records = chartly_pipeline::run(&profile.id, &content, &raw)
            .map_err(|e| ProfileFailure::failed(truncate_error(&format!("pipeline: {e}"))))?;
        let rows = records.len() as u64;

        let results = ResultsRequest {
            drone_id: self.config.drone_id.clone(),
            profile_id: profile.id.clone(),
            run_id: run_id.to_string(),
            data: records,
        };
        self.client
            .post_results(shutdown, &results)
            .await
            .map_err(|e| ProfileFailure::Partial {
                rows,
                detail: truncate_error(&format!("post results: {e}")),
            })?;
        Ok(rows)
    }

    fn profile_is_due(&self, profile: &ProfileEnvelope) -> bool {
        let interval = profile.interval.as_deref().and_then(parse_duration);
        let jitter_window = profile
            .jitter
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::ZERO);
        is_due(
            Utc::now(),
            self.last_run.get(&profile.id).copied(),
            interval,
            &self.config.drone_id,
            &profile.id,
            jitter_window,
        )
    }
}

/// Internal classification of a per-profile failure.
enum ProfileFailure {
    /// Pipeline output exists but delivery failed.
    Partial { rows: u64, detail: String },
    /// Nothing usable was produced.
    Failed { detail: String },
}

impl ProfileFailure {
    fn failed(detail: String) -> Self {
        Self::Failed { detail }
    }
}
