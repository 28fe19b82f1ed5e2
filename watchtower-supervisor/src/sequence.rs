// SPDX-License-Identifier: Apache-2.0

//! The start-ordering step sequencer (component C7): runs a list of steps
//! in registration order, threading each step's outcome into the next
//! step's matching continuation.
//!
//! Modeled on the upgrade sequence in
//! `DelayedStartupProcessMonitor`'s callers -- lock acquisition, schema
//! upgrade, data upgrades, filesystem-to-database migration, lock release --
//! each of which must run to completion, in order, before the main service
//! is admitted, with any failure branching into an explicit recovery step
//! that still has a chance to re-enter the success lane for the steps that
//! follow it.

use std::future::Future;
use std::pin::Pin;

/// The outcome threaded between consecutive steps: either a success value
/// or a failure value, both caller-defined types.
#[derive(Debug, Clone)]
pub enum Outcome<T, E> {
    Ok(T),
    Err(E),
}

impl<T, E> Outcome<T, E> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}

type Continuation<In, T, E> =
    Box<dyn Fn(In) -> Pin<Box<dyn Future<Output = Outcome<T, E>> + Send>> + Send + Sync>;

/// One step in the sequence, exposing a continuation for "the previous step
/// succeeded" and one for "the previous step failed". Either may itself
/// produce a success or a failure; whichever it produces is what the next
/// step receives.
pub struct Step<T, E> {
    name: &'static str,
    on_success: Continuation<T, T, E>,
    on_failure: Continuation<E, T, E>,
}

impl<T, E> Step<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<Succ, SuccFut, Fail, FailFut>(
        name: &'static str,
        on_success: Succ,
        on_failure: Fail,
    ) -> Self
    where
        Succ: Fn(T) -> SuccFut + Send + Sync + 'static,
        SuccFut: Future<Output = Outcome<T, E>> + Send + 'static,
        Fail: Fn(E) -> FailFut + Send + Sync + 'static,
        FailFut: Future<Output = Outcome<T, E>> + Send + 'static,
    {
        Step {
            name,
            on_success: Box::new(move |prev| Box::pin(on_success(prev))),
            on_failure: Box::new(move |prev| Box::pin(on_failure(prev))),
        }
    }

    /// A step whose continuations simply pass the prior outcome through
    /// unchanged in both lanes. Useful in tests and as a placeholder no-op
    /// stage.
    pub fn identity(name: &'static str) -> Self
    where
        T: Clone,
        E: Clone,
    {
        Step::new(
            name,
            |ok| async move { Outcome::Ok(ok) },
            |err| async move { Outcome::Err(err) },
        )
    }
}

/// Runs a fixed, ordered list of [`Step`]s, starting from an initial
/// outcome and threading each step's result into the next.
pub struct Sequencer<T, E> {
    steps: Vec<Step<T, E>>,
}

impl<T, E> Default for Sequencer<T, E> {
    fn default() -> Self {
        Sequencer { steps: Vec::new() }
    }
}

impl<T, E> Sequencer<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, step: Step<T, E>) -> Self {
        self.steps.push(step);
        self
    }

    /// Runs every step to completion, in registration order. Step *i+1*
    /// never starts before step *i*'s outcome is materialized. The returned
    /// outcome is whatever the last step produced.
    pub async fn run(self, initial: Outcome<T, E>) -> Outcome<T, E> {
        let mut current = initial;
        for step in self.steps {
            current = match current {
                Outcome::Ok(value) => {
                    tracing::debug!(step = step.name, "running success lane");
                    (step.on_success)(value).await
                }
                Outcome::Err(failure) => {
                    tracing::debug!(step = step.name, "running failure lane");
                    (step.on_failure)(failure).await
                }
            };
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_identity_steps_preserve_the_initial_input() {
        let sequencer: Sequencer<u32, String> = Sequencer::new()
            .push(Step::identity("a"))
            .push(Step::identity("b"))
            .push(Step::identity("c"));
        let result = sequencer.run(Outcome::Ok(42)).await;
        assert!(matches!(result, Outcome::Ok(42)));
    }

    #[tokio::test]
    async fn failure_branches_into_failure_lane_of_next_step() {
        let sequencer: Sequencer<u32, String> = Sequencer::new()
            .push(Step::new(
                "acquire-lock",
                |v: u32| async move { Outcome::Ok(v) },
                |e: String| async move { Outcome::Err(e) },
            ))
            .push(Step::new(
                "upgrade-schema",
                |_: u32| async move { Outcome::Err("schema upgrade failed".to_string()) },
                |e: String| async move { Outcome::Err(e) },
            ))
            .push(Step::new(
                "release-lock",
                |v: u32| async move { Outcome::Ok(v) },
                |e: String| async move {
                    tracing::warn!(error = %e, "running recovery");
                    Outcome::Err(e)
                },
            ));
        let result = sequencer.run(Outcome::Ok(1)).await;
        match result {
            Outcome::Err(e) => assert_eq!(e, "schema upgrade failed"),
            Outcome::Ok(_) => panic!("expected failure to propagate"),
        }
    }

    #[tokio::test]
    async fn failure_lane_can_recover_back_into_the_success_lane() {
        let sequencer: Sequencer<u32, String> = Sequencer::new()
            .push(Step::new(
                "maybe-fails",
                |_: u32| async move { Outcome::Err("store unavailable".to_string()) },
                |e: String| async move { Outcome::Err(e) },
            ))
            .push(Step::new(
                "recover-and-continue",
                |v: u32| async move { Outcome::Ok(v) },
                |_: String| async move { Outcome::Ok(99u32) },
            ))
            .push(Step::new(
                "final",
                |v: u32| async move { Outcome::Ok(v + 1) },
                |e: String| async move { Outcome::Err(e) },
            ));
        let result = sequencer.run(Outcome::Ok(1)).await;
        assert!(matches!(result, Outcome::Ok(100)));
    }
}
