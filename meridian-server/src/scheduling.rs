//! Scheduling classes.
//!
//! Handlers declare how urgent they are. Background work (backups, dumps,
//! bulk migrations) runs only while holding a permit from a bounded lane;
//! the class is visible to the running handler through [`current_class`].
//! Advisory only: nothing here affects the result of an operation.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingClass {
    Background,
    #[default]
    Normal,
    Elevated,
}

tokio::task_local! {
    static CURRENT_CLASS: SchedulingClass;
}

/// Class of the operation running on this task; `Normal` outside any lane.
pub fn current_class() -> SchedulingClass {
    CURRENT_CLASS.try_with(|class| *class).unwrap_or_default()
}

/// Admission control per scheduling class.
#[derive(Debug, Clone)]
pub struct SchedulingLanes {
    background: Arc<Semaphore>,
}

impl SchedulingLanes {
    pub fn new(background_permits: usize) -> Self {
        Self {
            background: Arc::new(Semaphore::new(background_permits.max(1))),
        }
    }

    pub fn background_available(&self) -> usize {
        self.background.available_permits()
    }

    /// Wait for admission to `class`'s lane. Background work blocks here
    /// until a permit frees up; other classes are admitted at once.
    pub async fn admit(&self, class: SchedulingClass) -> ServerResult<LanePermit> {
        let permit = match class {
            SchedulingClass::Background => Some(
                Arc::clone(&self.background)
                    .acquire_owned()
                    .await
                    .map_err(|_| ServerError::internal("Background lane closed"))?,
            ),
            _ => None,
        };
        Ok(LanePermit {
            class,
            _permit: permit,
        })
    }

    /// Run `fut` tagged with `class`. The tag is gone once `fut` finishes,
    /// whether it succeeded, failed or was dropped.
    pub async fn run<F, T>(&self, class: SchedulingClass, fut: F) -> ServerResult<T>
    where
        F: Future<Output = ServerResult<T>>,
    {
        let permit = self.admit(class).await?;
        permit.scope(fut).await
    }
}

/// Admission to a lane; the background permit is released on drop.
#[derive(Debug)]
pub struct LanePermit {
    class: SchedulingClass,
    _permit: Option<OwnedSemaphorePermit>,
}

impl LanePermit {
    pub fn class(&self) -> SchedulingClass {
        self.class
    }

    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        CURRENT_CLASS.scope(self.class, fut).await
    }
}
