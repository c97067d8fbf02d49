//! Keygen pre-parameters: Paillier key material and the auxiliary
//! `NTilde`/`h1`/`h2` modulus
//!
//! Generating safe primes dominates the cost of a keygen, which is why these
//! are produced ahead of time by a background pool.

use super::TssError;
use libpaillier::unknown_order::BigNumber;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Odd primes used to sieve candidates before the primality test
const SMALL_PRIMES: [u64; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

const MIN_PRIME_BITS: usize = 16;

/// Paillier private key
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct PaillierPrivateKey {
    /// Public modulus `N = p * q`
    pub n: BigNumber,
    /// `lcm(p - 1, q - 1)`
    pub lambda_n: BigNumber,
    /// `(p - 1) * (q - 1)`
    pub phi_n: BigNumber,
}

impl fmt::Debug for PaillierPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaillierPrivateKey")
            .field("n_bits", &self.n.bit_length())
            .finish_non_exhaustive()
    }
}

/// Everything a party needs before keygen round one
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct LocalPreParams {
    pub paillier_sk: PaillierPrivateKey,
    /// Product of two safe primes `P = 2p + 1`, `Q = 2q + 1`
    pub ntilde: BigNumber,
    pub h1i: BigNumber,
    /// `h1i ^ alpha mod ntilde`
    pub h2i: BigNumber,
    pub alpha: BigNumber,
    /// `alpha ^ -1 mod p * q`
    pub beta: BigNumber,
    pub p: BigNumber,
    pub q: BigNumber,
}

impl fmt::Debug for LocalPreParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPreParams")
            .field("paillier_sk", &self.paillier_sk)
            .field("ntilde_bits", &self.ntilde.bit_length())
            .finish_non_exhaustive()
    }
}

impl LocalPreParams {
    /// Cheap structural check done before a party is created
    pub fn validate(&self) -> bool {
        let non_zero = [
            &self.paillier_sk.n,
            &self.ntilde,
            &self.h1i,
            &self.h2i,
            &self.alpha,
            &self.beta,
            &self.p,
            &self.q,
        ]
        .iter()
        .all(|value| !value.is_zero());

        non_zero && self.h1i != self.h2i
    }
}

/// Generate pre-parameters with primes of `prime_bits` bits.
///
/// Runs on the calling thread and fails with [`TssError::PreParamsTimeout`]
/// once `timeout` elapses. The deadline is checked between prime candidates,
/// so nothing keeps running after the call returns.
pub fn generate_pre_params(
    prime_bits: usize,
    timeout: Duration,
    concurrency: usize,
) -> Result<LocalPreParams, TssError> {
    generate_pre_params_until(prime_bits, timeout, concurrency, || false)
}

/// [`generate_pre_params`] that also gives up as soon as `cancelled` returns
/// `true`
pub fn generate_pre_params_until<C>(
    prime_bits: usize,
    timeout: Duration,
    concurrency: usize,
    cancelled: C,
) -> Result<LocalPreParams, TssError>
where
    C: Fn() -> bool + Sync,
{
    if prime_bits < MIN_PRIME_BITS {
        return Err(TssError::PreParamsGeneration(format!(
            "primes must have at least {MIN_PRIME_BITS} bits, got {prime_bits}"
        )));
    }

    let deadline = Deadline {
        at: Instant::now() + timeout,
        cancelled: &cancelled,
    };
    generate(prime_bits, concurrency, &deadline)
}

struct Deadline<'a> {
    at: Instant,
    cancelled: &'a (dyn Fn() -> bool + Sync),
}

impl Deadline<'_> {
    fn check(&self) -> Result<(), TssError> {
        if (self.cancelled)() {
            return Err(TssError::PreParamsGeneration("cancelled".into()));
        }
        if Instant::now() >= self.at {
            return Err(TssError::PreParamsTimeout);
        }
        Ok(())
    }
}

fn generate(
    prime_bits: usize,
    concurrency: usize,
    deadline: &Deadline<'_>,
) -> Result<LocalPreParams, TssError> {
    debug!(prime_bits, concurrency, "Generating pre-parameters");

    let (paillier_sk, safe_primes) = join(
        concurrency,
        || paillier_key(prime_bits, deadline),
        || distinct_pair(|| safe_prime(prime_bits, deadline)),
    );
    let paillier_sk = paillier_sk?;
    let (mut safe_p, mut safe_q) = safe_primes?;

    let one = BigNumber::one();
    let two = BigNumber::from(2u64);
    let ntilde = &safe_p * &safe_q;
    let p = (&safe_p - &one) / &two;
    let q = (&safe_q - &one) / &two;
    let pq = &p * &q;
    safe_p.zeroize();
    safe_q.zeroize();

    loop {
        deadline.check()?;

        let f = BigNumber::random(&ntilde);
        let h1i = f.modmul(&f, &ntilde);
        if h1i.is_zero() || h1i == one {
            continue;
        }

        let alpha = BigNumber::random(&ntilde);
        let Some(beta) = alpha.invert(&pq) else {
            continue;
        };

        let h2i = h1i.modpow(&alpha, &ntilde);
        if h2i == h1i {
            continue;
        }

        return Ok(LocalPreParams {
            paillier_sk,
            ntilde,
            h1i,
            h2i,
            alpha,
            beta,
            p,
            q,
        });
    }
}

fn paillier_key(prime_bits: usize, deadline: &Deadline<'_>) -> Result<PaillierPrivateKey, TssError> {
    let (mut p, mut q) = distinct_pair(|| prime(prime_bits, deadline))?;
    let one = BigNumber::one();
    let p_minus_one = &p - &one;
    let q_minus_one = &q - &one;

    let phi_n = &p_minus_one * &q_minus_one;
    let lambda_n = &phi_n / &p_minus_one.gcd(&q_minus_one);
    let n = &p * &q;
    p.zeroize();
    q.zeroize();

    Ok(PaillierPrivateKey {
        n,
        lambda_n,
        phi_n,
    })
}

fn distinct_pair(
    mut generate: impl FnMut() -> Result<BigNumber, TssError>,
) -> Result<(BigNumber, BigNumber), TssError> {
    let first = generate()?;
    loop {
        let second = generate()?;
        if second != first {
            return Ok((first, second));
        }
    }
}

/// Random odd number of exactly `bits` bits
fn odd_candidate(bits: usize) -> BigNumber {
    let top = BigNumber::one() << (bits - 1);
    let candidate = &BigNumber::random(&top) + &top;
    if (&candidate % &BigNumber::from(2u64)).is_zero() {
        &candidate + &BigNumber::one()
    } else {
        candidate
    }
}

fn prime(bits: usize, deadline: &Deadline<'_>) -> Result<BigNumber, TssError> {
    loop {
        deadline.check()?;

        let candidate = odd_candidate(bits);
        let divisible = SMALL_PRIMES
            .iter()
            .any(|small| (&candidate % &BigNumber::from(*small)).is_zero());
        if !divisible && candidate.is_prime() {
            return Ok(candidate);
        }
    }
}

/// Safe prime `2q + 1` of exactly `bits` bits
fn safe_prime(bits: usize, deadline: &Deadline<'_>) -> Result<BigNumber, TssError> {
    loop {
        deadline.check()?;

        // q = (small - 1) / 2 mod small makes 2q + 1 divisible by small
        let q = odd_candidate(bits - 1);
        let sieved = SMALL_PRIMES.iter().any(|small| {
            let rem = &q % &BigNumber::from(*small);
            rem.is_zero() || rem == BigNumber::from((small - 1) / 2)
        });
        if sieved || !q.is_prime() {
            continue;
        }

        let candidate = &(&q << 1usize) + &BigNumber::one();
        if candidate.is_prime() {
            return Ok(candidate);
        }
    }
}

#[cfg(feature = "multi-thread")]
fn join<A, B, RA, RB>(concurrency: usize, a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    if concurrency > 1 {
        rayon::join(a, b)
    } else {
        (a(), b())
    }
}

#[cfg(not(feature = "multi-thread"))]
fn join<A, B, RA, RB>(_concurrency: usize, a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA,
    B: FnOnce() -> RB,
{
    (a(), b())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_generated_pre_params_are_consistent() {
        let pre_params = generate_pre_params(64, Duration::from_secs(60), 2).unwrap();

        assert!(pre_params.validate());

        let one = BigNumber::one();
        let two = BigNumber::from(2u64);
        let safe_p = &(&pre_params.p * &two) + &one;
        let safe_q = &(&pre_params.q * &two) + &one;
        assert_eq!(&safe_p * &safe_q, pre_params.ntilde);

        let pq = &pre_params.p * &pre_params.q;
        assert_eq!(pre_params.alpha.modmul(&pre_params.beta, &pq), one);
        assert_eq!(
            pre_params.h1i.modpow(&pre_params.alpha, &pre_params.ntilde),
            pre_params.h2i
        );
    }

    #[test]
    fn test_generation_timeout() {
        let result = generate_pre_params(2048, Duration::from_millis(1), 1);
        assert!(matches!(result, Err(TssError::PreParamsTimeout)));
    }

    #[test]
    fn test_timed_out_generation_stops_promptly() {
        for _ in 0..4 {
            let started = Instant::now();
            let result = generate_pre_params(1024, Duration::from_millis(20), 2);
            assert!(matches!(result, Err(TssError::PreParamsTimeout)));
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "generation kept running after its deadline: {:?}",
                started.elapsed()
            );
        }
    }

    #[test]
    fn test_cancelled_generation_stops() {
        let cancelled = AtomicBool::new(false);

        let started = Instant::now();
        let result = thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                cancelled.store(true, Ordering::SeqCst);
            });
            generate_pre_params_until(2048, Duration::from_secs(600), 1, || {
                cancelled.load(Ordering::SeqCst)
            })
        });

        assert!(matches!(result, Err(TssError::PreParamsGeneration(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_tiny_primes() {
        let result = generate_pre_params(8, Duration::from_secs(1), 1);
        assert!(matches!(result, Err(TssError::PreParamsGeneration(_))));
    }

    #[test]
    fn test_safe_prime_has_requested_size() {
        let no_deadline = || false;
        let deadline = Deadline {
            at: Instant::now() + Duration::from_secs(60),
            cancelled: &no_deadline,
        };

        let safe = safe_prime(64, &deadline).unwrap();
        assert_eq!(safe.bit_length(), 64);
        assert!(safe.is_prime());
        assert!(((&safe - &BigNumber::one()) >> 1usize).is_prime());
    }

    #[test]
    fn test_debug_output_hides_secrets() {
        let pre_params = generate_pre_params(64, Duration::from_secs(60), 1).unwrap();
        let rendered = format!("{pre_params:?}");

        assert!(rendered.contains("ntilde_bits"));
        assert!(!rendered.contains(&pre_params.p.to_string()));
        assert!(!rendered.contains(&pre_params.paillier_sk.phi_n.to_string()));
    }

    #[test]
    fn test_validate_rejects_equal_generators() {
        let mut pre_params = generate_pre_params(64, Duration::from_secs(60), 1).unwrap();
        pre_params.h2i = pre_params.h1i.clone();
        assert!(!pre_params.validate());
    }
}
