//! Reward computation.
//!
//! Base +1.0 on success, -1.0 on failure; +0.5 bonus when a success
//! recovers from an earlier failure (`retries > 0`); -0.1 per retry on
//! failure; -0.5 when a validator overturns an executor's `ok`. Clamped
//! to [-2.0, 2.0].

/// Lower bound for any persisted reward.
pub const REWARD_MIN: f32 = -2.0;
/// Upper bound for any persisted reward.
pub const REWARD_MAX: f32 = 2.0;

/// Compute the reward scalar for a terminal task.
pub fn compute_reward(success: bool, retries: i32, validation_rejected: bool) -> f32 {
    let reward = if success {
        let correction_bonus = if retries > 0 { 0.5 } else { 0.0 };
        1.0 + correction_bonus
    } else {
        let retry_cost = 0.1 * retries as f32;
        let validation_penalty = if validation_rejected { 0.5 } else { 0.0 };
        -1.0 - retry_cost - validation_penalty
    };
    reward.clamp(REWARD_MIN, REWARD_MAX)
}
