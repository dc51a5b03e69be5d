//! Service names for generated replicas.

use relcoll_core::{CoreResult, ServiceName};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Prefix of every generated service name.
pub const SERVICE_NAME_BASE: &str = "fabric:/unittest/service";

/// Supplies the service name of each generated replica.
pub trait ServiceNameGenerator: Send {
    /// Returns the next name.
    fn next_name(&mut self) -> CoreResult<ServiceName>;
}

/// `fabric:/unittest/service<n>` with a random non-negative `n`.
#[derive(Debug)]
pub struct RandomServiceNames {
    rng: StdRng,
}

impl RandomServiceNames {
    /// Seeds from the operating system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeds deterministically.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomServiceNames {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceNameGenerator for RandomServiceNames {
    fn next_name(&mut self) -> CoreResult<ServiceName> {
        let n: u32 = self.rng.gen_range(0..i32::MAX as u32);
        ServiceName::new(format!("{SERVICE_NAME_BASE}{n}"))
    }
}

/// `fabric:/unittest/service0`, `service1`, ...
#[derive(Debug, Default)]
pub struct SequentialServiceNames {
    next: u64,
}

impl SequentialServiceNames {
    /// Starts counting at `first`.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self { next: first }
    }
}

impl ServiceNameGenerator for SequentialServiceNames {
    fn next_name(&mut self) -> CoreResult<ServiceName> {
        let name = ServiceName::new(format!("{SERVICE_NAME_BASE}{}", self.next))?;
        self.next += 1;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_names_count_up() {
        let mut names = SequentialServiceNames::starting_at(7);
        assert_eq!(names.next_name().unwrap().as_str(), "fabric:/unittest/service7");
        assert_eq!(names.next_name().unwrap().as_str(), "fabric:/unittest/service8");
    }

    #[test]
    fn seeded_random_names_repeat() {
        let mut a = RandomServiceNames::from_seed(42);
        let mut b = RandomServiceNames::from_seed(42);
        for _ in 0..3 {
            let name = a.next_name().unwrap();
            assert!(name.as_str().starts_with(SERVICE_NAME_BASE));
            assert_eq!(name, b.next_name().unwrap());
        }
    }
}
