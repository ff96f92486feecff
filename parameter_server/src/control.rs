//! The control-plane variable store.
//!
//! Every variable has a single designated writer (the optimizer for the
//! step counter, one worker at a time for the reader cursor, the chief for
//! the validation state); the store itself only guarantees atomicity of the
//! individual operations, with a true compare-and-set for the reader flag.

use comms::msg::{ControlSnapshot, VarId, VarValue};
use parking_lot::Mutex;

/// The control-plane variables and the learning-rate schedule replica.
pub struct ControlStore {
    inner: Mutex<Vars>,
}

struct Vars {
    global_step: i64,
    reading: bool,
    position: i64,
    validated_step: i64,
    validation_loss: f32,
    learning_rate_fact: f32,
    should_terminate: bool,

    initial_learning_rate: f32,
    learning_rate_decay: f32,
    /// The decay horizon; installed by the chief before the first apply.
    num_steps: Option<i64>,
}

impl ControlStore {
    /// Creates the store in its initial state.
    ///
    /// # Arguments
    /// * `valid_frequency` - The validation interval; the validated step
    ///   starts at its negation so the first validation fires immediately.
    /// * `initial_learning_rate` - The base learning rate of the schedule.
    /// * `learning_rate_decay` - The exponential decay rate.
    pub fn new(valid_frequency: i64, initial_learning_rate: f32, learning_rate_decay: f32) -> Self {
        Self {
            inner: Mutex::new(Vars {
                global_step: 0,
                reading: false,
                position: 0,
                validated_step: -valid_frequency,
                validation_loss: f32::MAX,
                learning_rate_fact: 1.0,
                should_terminate: false,
                initial_learning_rate,
                learning_rate_decay,
                num_steps: None,
            }),
        }
    }

    /// Installs the decay horizon. Chief only, once per session.
    pub fn configure(&self, num_steps: i64) {
        self.inner.lock().num_steps = Some(num_steps.max(1));
    }

    /// Whether the decay horizon has been installed.
    pub fn is_configured(&self) -> bool {
        self.inner.lock().num_steps.is_some()
    }

    /// Overwrites the persistent variables from a checkpoint snapshot.
    pub fn restore(&self, snapshot: ControlSnapshot) {
        let mut vars = self.inner.lock();
        vars.global_step = snapshot.global_step;
        vars.position = snapshot.position;
        vars.validated_step = snapshot.validated_step;
        vars.validation_loss = snapshot.validation_loss;
        vars.learning_rate_fact = snapshot.learning_rate_fact;
    }

    /// The persistent variables, as stored in checkpoints.
    pub fn snapshot(&self) -> ControlSnapshot {
        let vars = self.inner.lock();
        ControlSnapshot {
            global_step: vars.global_step,
            position: vars.position,
            validated_step: vars.validated_step,
            validation_loss: vars.validation_loss,
            learning_rate_fact: vars.learning_rate_fact,
        }
    }

    /// Reads one variable.
    pub fn read(&self, id: VarId) -> VarValue {
        let vars = self.inner.lock();
        match id {
            VarId::GlobalStep => VarValue::Int(vars.global_step),
            VarId::Reading => VarValue::Bool(vars.reading),
            VarId::Position => VarValue::Int(vars.position),
            VarId::ValidatedStep => VarValue::Int(vars.validated_step),
            VarId::ValidationLoss => VarValue::Float(vars.validation_loss),
            VarId::LearningRateFact => VarValue::Float(vars.learning_rate_fact),
            VarId::ShouldTerminate => VarValue::Bool(vars.should_terminate),
            VarId::LearningRate => VarValue::Float(vars.learning_rate()),
        }
    }

    /// Writes one variable.
    ///
    /// # Returns
    /// `false` when the variable is derived or the value type does not
    /// match.
    #[must_use]
    pub fn write(&self, id: VarId, value: VarValue) -> bool {
        let mut vars = self.inner.lock();
        match (id, value) {
            (VarId::GlobalStep, VarValue::Int(v)) => vars.global_step = v,
            (VarId::Reading, VarValue::Bool(v)) => vars.reading = v,
            (VarId::Position, VarValue::Int(v)) => vars.position = v,
            (VarId::ValidatedStep, VarValue::Int(v)) => vars.validated_step = v,
            (VarId::ValidationLoss, VarValue::Float(v)) => vars.validation_loss = v,
            (VarId::LearningRateFact, VarValue::Float(v)) => vars.learning_rate_fact = v,
            (VarId::ShouldTerminate, VarValue::Bool(v)) => vars.should_terminate = v,
            _ => return false,
        }
        true
    }

    /// Everything the step loop polls, read atomically.
    pub fn loop_state(&self) -> (i64, i64, bool) {
        let vars = self.inner.lock();
        (vars.global_step, vars.validated_step, vars.should_terminate)
    }

    /// Compare-and-set acquisition of the reader flag.
    ///
    /// # Returns
    /// `true` when this caller took the flag from false to true.
    pub fn try_acquire_reader(&self) -> bool {
        let mut vars = self.inner.lock();
        !std::mem::replace(&mut vars.reading, true)
    }

    /// Releases the reader flag.
    pub fn release_reader(&self) {
        self.inner.lock().reading = false;
    }

    /// Assigns `validated_step <- global_step`.
    pub fn mark_validated(&self) {
        let mut vars = self.inner.lock();
        vars.validated_step = vars.global_step;
    }

    /// Halves the learning-rate factor.
    pub fn halve_learning_rate_fact(&self) {
        let mut vars = self.inner.lock();
        vars.learning_rate_fact /= 2.0;
    }

    /// Raises the cooperative stop flag.
    pub fn terminate(&self) {
        self.inner.lock().should_terminate = true;
    }

    /// The learning rate the optimizer uses at the current step.
    pub fn learning_rate(&self) -> f32 {
        self.inner.lock().learning_rate()
    }

    /// Advances the step counter by one aggregated update.
    ///
    /// # Returns
    /// The new step value.
    pub fn advance_step(&self) -> i64 {
        let mut vars = self.inner.lock();
        vars.global_step += 1;
        vars.global_step
    }
}

impl Vars {
    /// Exponential decay over the step horizon, scaled by the factor.
    fn learning_rate(&self) -> f32 {
        let num_steps = self.num_steps.unwrap_or(1) as f32;
        let exponent = self.global_step as f32 / num_steps;

        self.initial_learning_rate * self.learning_rate_decay.powf(exponent) * self.learning_rate_fact
    }
}
