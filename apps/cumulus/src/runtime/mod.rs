//! Runtime assignment: decide between reusing an existing assignment and
//! acquiring fresh capacity, with accelerator prioritization and retry
//! across candidates on transient failures.

use std::sync::Arc;
use uuid::Uuid;

use crate::api::{AcceleratorFamily, ApiError, AssignResponse, AssignedRuntime, ControlPlane};

/// Modern accelerators worth trying before whatever else the account is
/// eligible for. Matched case-insensitively.
const PREFERRED_GPUS: &[&str] = &["a100", "l4", "p100", "t4", "v100"];

/// Candidate name used for CPU-only runtimes, which have no accelerator
/// list to consult.
const DEFAULT_RUNTIME: &str = "default";

#[derive(Debug, Clone)]
pub struct AssignOptions {
    pub force_new: bool,
    pub family: AcceleratorFamily,
    /// Suppress progress logging; errors still propagate.
    pub quiet: bool,
}

impl Default for AssignOptions {
    fn default() -> Self {
        Self {
            force_new: false,
            family: AcceleratorFamily::Default,
            quiet: false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AssignError {
    #[error("account is at its concurrent runtime limit ({detail}); release a runtime with `cumulus shutdown` or rerun without requesting a new one")]
    Capacity { detail: String },
    #[error("temporarily out of capacity; attempted accelerators: {}", .attempted.join(", "))]
    Exhausted { attempted: Vec<String> },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Stateless over the control plane; cheap to construct per call.
pub struct RuntimeManager {
    api: Arc<dyn ControlPlane>,
}

impl RuntimeManager {
    pub fn new(api: Arc<dyn ControlPlane>) -> Self {
        Self { api }
    }

    pub async fn assign(&self, opts: &AssignOptions) -> Result<AssignedRuntime, AssignError> {
        if !opts.force_new {
            if let Some(runtime) = self.try_reuse(opts.family, opts.quiet).await {
                return Ok(runtime);
            }
        }

        let candidates = self.candidates(opts.family).await?;
        let mut attempted: Vec<String> = Vec::new();
        for candidate in &candidates {
            attempted.push(candidate.clone());
            let idempotency_key = Uuid::new_v4().to_string();
            match self
                .api
                .assign(&idempotency_key, opts.family, Some(candidate))
                .await
            {
                Ok(response) => return finish_assignment(response, opts.quiet),
                Err(err) if err.is_capacity_exceeded() => {
                    // The quota is spent; no other candidate can allocate
                    // either. Reuse whatever holds the quota if we can.
                    tracing::debug!(
                        target: "cumulus::runtime",
                        candidate = %candidate,
                        "assignment quota exhausted, falling back to reuse"
                    );
                    if let Some(runtime) = self.try_reuse(opts.family, opts.quiet).await {
                        return Ok(runtime);
                    }
                    return Err(AssignError::Capacity {
                        detail: err.to_string(),
                    });
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        target: "cumulus::runtime",
                        candidate = %candidate,
                        %err,
                        "transient assignment failure, trying next candidate"
                    );
                }
                Err(err) => return Err(AssignError::Api(err)),
            }
        }
        Err(AssignError::Exhausted { attempted })
    }

    /// First existing assignment in the requested family, with its proxy
    /// token refreshed. Any failure just means no reuse.
    async fn try_reuse(&self, family: AcceleratorFamily, quiet: bool) -> Option<AssignedRuntime> {
        let assignments = match self.api.list_assignments().await {
            Ok(assignments) => assignments,
            Err(err) => {
                tracing::debug!(target: "cumulus::runtime", %err, "assignment listing failed");
                return None;
            }
        };
        let assignment = assignments.into_iter().find(|a| a.family == family)?;
        match self.api.refresh_connection(&assignment.endpoint).await {
            Ok(proxy) => {
                if !quiet {
                    tracing::info!(
                        target: "cumulus::runtime",
                        endpoint = %assignment.endpoint,
                        accelerator = %assignment.accelerator,
                        "reusing existing runtime assignment"
                    );
                }
                Some(assignment.into_runtime(proxy))
            }
            Err(err) => {
                tracing::debug!(
                    target: "cumulus::runtime",
                    endpoint = %assignment.endpoint,
                    %err,
                    "proxy refresh failed, falling through to fresh allocation"
                );
                None
            }
        }
    }

    async fn candidates(&self, family: AcceleratorFamily) -> Result<Vec<String>, AssignError> {
        match family {
            AcceleratorFamily::Gpu => {
                let eligible = self.api.list_accelerators(AcceleratorFamily::Gpu).await?;
                Ok(prioritize_gpus(&eligible))
            }
            AcceleratorFamily::Tpu => {
                Ok(self.api.list_accelerators(AcceleratorFamily::Tpu).await?)
            }
            AcceleratorFamily::Default => Ok(vec![DEFAULT_RUNTIME.to_string()]),
        }
    }
}

fn finish_assignment(response: AssignResponse, quiet: bool) -> Result<AssignedRuntime, AssignError> {
    let AssignResponse { assignment, is_new } = response;
    let proxy = assignment.proxy.clone().ok_or_else(|| {
        AssignError::Api(ApiError::InvalidResponse(
            "assignment response missing proxy credentials".into(),
        ))
    })?;
    let runtime = assignment.into_runtime(proxy);
    if !quiet {
        tracing::info!(
            target: "cumulus::runtime",
            endpoint = %runtime.endpoint,
            accelerator = %runtime.accelerator,
            is_new,
            "runtime assigned"
        );
    }
    Ok(runtime)
}

/// Reorder eligible GPUs so the preferred modern subset comes first,
/// preserving relative order within each group.
pub fn prioritize_gpus(eligible: &[String]) -> Vec<String> {
    let (mut preferred, mut rest): (Vec<String>, Vec<String>) =
        eligible.iter().cloned().partition(|name| {
            let lowered = name.to_ascii_lowercase();
            PREFERRED_GPUS.iter().any(|p| *p == lowered)
        });
    preferred.append(&mut rest);
    preferred
}
