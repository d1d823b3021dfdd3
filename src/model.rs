//! Channel-model math: seeded impairment PRNG, the Gilbert–Elliott bursty
//! loss model, the RED drop curve, and serialisation-delay arithmetic.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded PRNG driving every impairment decision of one delivery channel.
///
/// Seeding happens once at channel creation; reconfiguring a session never
/// reseeds, so a fixed seed reproduces the same decision sequence for the
/// same ingress trace.
#[derive(Debug)]
pub struct ImpairmentRng {
    rng: ChaCha8Rng,
}

impl ImpairmentRng {
    /// Create from a configuration seed. A seed of 0 picks a random seed.
    pub fn from_config_seed(seed: u64) -> Self {
        let rng = if seed == 0 {
            ChaCha8Rng::seed_from_u64(rand::thread_rng().next_u64())
        } else {
            ChaCha8Rng::seed_from_u64(seed)
        };
        Self { rng }
    }

    /// Bernoulli draw with probability `p`.
    pub fn chance(&mut self, p: f32) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.rng.gen::<f32>() < p
    }

    /// Uniform index in `[0, n)`. `n` must be nonzero.
    pub fn uniform_index(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    /// Uniform bit position in a byte.
    pub fn bit_position(&mut self) -> u32 {
        self.rng.gen_range(0..8)
    }
}

/// Two-state Markov loss channel.
///
/// In the *good* state a datagram is dropped with probability `loss_rate`,
/// entering the *bad* state. In the *bad* state a datagram is delivered with
/// probability `delivery_rate`, returning to *good*; otherwise it is dropped
/// and the burst continues. The two parameters set the mean loss rate and the
/// burstiness independently.
#[derive(Debug, Default)]
pub struct GilbertElliott {
    in_burst_loss: bool,
}

impl GilbertElliott {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the fate of one datagram. Returns `true` to deliver.
    pub fn roll(&mut self, rng: &mut ImpairmentRng, loss_rate: f32, delivery_rate: f32) -> bool {
        // A lossless channel is pinned to the good state.
        if loss_rate <= 0.0 {
            self.in_burst_loss = false;
            return true;
        }

        if self.in_burst_loss {
            if rng.chance(delivery_rate) {
                self.in_burst_loss = false;
                true
            } else {
                false
            }
        } else if rng.chance(loss_rate) {
            self.in_burst_loss = true;
            false
        } else {
            true
        }
    }

    /// Whether the channel is currently in a loss burst.
    pub fn in_burst_loss(&self) -> bool {
        self.in_burst_loss
    }
}

/// RED drop probability for a router queue at `depth_usec` of queued delay.
///
/// Rises linearly from 0 at half the queue cap to 1 at the cap.
pub fn red_drop_probability(depth_usec: u64, cap_usec: u64) -> f64 {
    if cap_usec == 0 {
        return 0.0;
    }
    let midpoint = cap_usec / 2;
    if depth_usec <= midpoint {
        return 0.0;
    }
    if depth_usec >= cap_usec {
        return 1.0;
    }
    (depth_usec - midpoint) as f64 / (cap_usec - midpoint) as f64
}

/// Time to clock `bytes` onto a link of `mbps` megabits per second, in
/// microseconds. An `mbps` of 0 (or a non-finite value) means unlimited
/// bandwidth.
pub fn serialization_usec(bytes: usize, mbps: f64) -> u64 {
    if mbps <= 0.0 || !mbps.is_finite() {
        return 0;
    }
    // bits / (mbps * 1e6 bits/s) seconds == bits / mbps microseconds.
    ((bytes as f64 * 8.0) / mbps).round() as u64
}
