//! Jittered interval math for polling and supervised loops.

use rand::Rng;

/// Draw an inter-event time from an exponential distribution with the given
/// average. The argument to the logarithm is bounded away from zero so the
/// draw is always finite.
pub fn poisson_interval(average_interval: f64) -> f64 {
    let u: f64 = rand::rng().random_range(0.0..1.0);
    -(1.0 - u).max(1e-10).ln() * average_interval
}

/// A Poisson inter-event time clamped to
/// `[average - cf * average, average + cf * average]`.
///
/// Keeps the desirable de-synchronization of Poisson arrivals while bounding
/// how far any single interval strays from the average.
pub fn clamped_poisson_interval(average_interval: f64, clamping_factor: f64) -> f64 {
    let upper_bound = average_interval * (1.0 + clamping_factor);
    let lower_bound = (average_interval - (upper_bound - average_interval)).max(0.0);
    poisson_interval(average_interval).clamp(lower_bound, upper_bound)
}
