use rand::{distributions::Alphanumeric, seq::index, Rng};

/// `len` random alphanumeric characters.
pub fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `random_len` random characters followed by `fill_len` copies of `'a'`.
pub fn random_string_with_fill<R: Rng + ?Sized>(
    rng: &mut R,
    random_len: usize,
    fill_len: usize,
) -> String {
    let mut s = random_string(rng, random_len);
    s.extend(core::iter::repeat('a').take(fill_len));
    s
}

/// Indices of `k` distinct positions out of `0..n`, in ascending order.
pub fn random_indices<R: Rng + ?Sized>(rng: &mut R, n: usize, k: usize) -> Vec<usize> {
    let mut picked = index::sample(rng, n, k.min(n)).into_vec();
    picked.sort_unstable();
    picked
}

/// Log progress once per order of magnitude below `total`.
///
/// `log_every_n(2500) == 100`, `log_every_n(30) == 1`.
pub fn log_every_n(total: usize) -> usize {
    if total < 100 {
        return 1;
    }
    let digits = total.ilog10();
    10usize.pow(digits - 1)
}
