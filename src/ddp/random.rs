//! # Seeded Randomness
//!
//! Id and secret generation. Unseeded generators draw from OS entropy. A
//! method call may carry a `randomSeed`; handlers then draw ids from a named
//! stream seeded with it. Seeded streams run the Alea generator, so a Meteor
//! client simulating the same call with the same seed produces the same ids.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Alphabet for ids, without look-alike characters
pub const UNMISTAKABLE_CHARS: &str = "23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

/// URL-safe base64 alphabet for secrets
pub const BASE64_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Default id length, about 96 bits of entropy
pub const ID_LENGTH: usize = 17;

/// Default secret length, 256 bits of entropy
pub const SECRET_LENGTH: usize = 43;

const TWO_POW_32: f64 = 4_294_967_296.0;
const TWO_POW_NEG_32: f64 = 2.328_306_436_538_696_3e-10;

/// Alea's string hash, fed one UTF-16 unit at a time
struct Mash {
    n: f64,
}

impl Mash {
    fn new() -> Self {
        Self {
            n: f64::from(0xefc8_249d_u32),
        }
    }

    fn mash(&mut self, data: &str) -> f64 {
        for unit in data.encode_utf16() {
            self.n += f64::from(unit);
            let mut h = 0.025_196_032_824_169_38 * self.n;
            self.n = to_uint32(h);
            h -= self.n;
            h *= self.n;
            self.n = to_uint32(h);
            h -= self.n;
            self.n += h * TWO_POW_32;
        }
        to_uint32(self.n) * TWO_POW_NEG_32
    }
}

/// `x >>> 0` for the non-negative values Mash produces
fn to_uint32(x: f64) -> f64 {
    x.trunc() % TWO_POW_32
}

/// Johannes Baagøe's Alea generator
#[derive(Debug, Clone)]
struct Alea {
    s0: f64,
    s1: f64,
    s2: f64,
    c: f64,
}

impl Alea {
    fn new<S: AsRef<str>>(seeds: &[S]) -> Self {
        let mut mash = Mash::new();
        let mut s0 = mash.mash(" ");
        let mut s1 = mash.mash(" ");
        let mut s2 = mash.mash(" ");
        for seed in seeds {
            for s in [&mut s0, &mut s1, &mut s2] {
                *s -= mash.mash(seed.as_ref());
                if *s < 0.0 {
                    *s += 1.0;
                }
            }
        }
        Self { s0, s1, s2, c: 1.0 }
    }

    fn next(&mut self) -> f64 {
        let t = 2_091_639.0 * self.s0 + self.c * TWO_POW_NEG_32;
        self.s0 = self.s1;
        self.s1 = self.s2;
        self.c = t.trunc();
        self.s2 = t - self.c;
        self.s2
    }
}

#[derive(Debug, Clone)]
enum Source {
    Entropy(StdRng),
    Seeded(Alea),
}

/// Random generator, either from entropy or from a list of seeds
#[derive(Debug, Clone)]
pub struct Random {
    source: Source,
}

impl Random {
    /// Generator seeded from OS entropy
    pub fn new() -> Self {
        Self {
            source: Source::Entropy(StdRng::from_entropy()),
        }
    }

    /// Deterministic Alea generator: the same seeds always give the same
    /// sequence
    pub fn from_seeds<S: AsRef<str>>(seeds: &[S]) -> Self {
        Self {
            source: Source::Seeded(Alea::new(seeds)),
        }
    }

    /// Uniform value in `[0, 1)`
    pub fn fraction(&mut self) -> f64 {
        match &mut self.source {
            Source::Entropy(rng) => rng.gen::<f64>(),
            Source::Seeded(alea) => alea.next(),
        }
    }

    pub fn hex_string(&mut self, digits: usize) -> String {
        self.random_string(digits, "0123456789abcdef")
    }

    /// Document-style id of `ID_LENGTH` characters
    pub fn id(&mut self) -> String {
        self.id_of_length(ID_LENGTH)
    }

    pub fn id_of_length(&mut self, chars: usize) -> String {
        self.random_string(chars, UNMISTAKABLE_CHARS)
    }

    /// Secret token of `SECRET_LENGTH` characters
    pub fn secret(&mut self) -> String {
        self.random_string(SECRET_LENGTH, BASE64_CHARS)
    }

    /// Pick one element; `None` when empty
    pub fn choice<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let index = (self.fraction() * items.len() as f64).floor() as usize;
        items.get(index.min(items.len() - 1))
    }

    fn random_string(&mut self, count: usize, alphabet: &str) -> String {
        let chars: Vec<char> = alphabet.chars().collect();
        (0..count)
            .filter_map(|_| self.choice(&chars).copied())
            .collect()
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

/// Named random streams derived from one seed
///
/// Stream names look like `/collection/Tasks` or `/rpc/add-task`.
#[derive(Debug, Clone)]
pub struct RandomStream {
    seed: String,
    streams: HashMap<String, Random>,
}

impl RandomStream {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            streams: HashMap::new(),
        }
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Get (creating on first use) the stream for `name`
    pub fn get_stream(&mut self, name: &str) -> &mut Random {
        let seed = &self.seed;
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| Random::from_seeds(&[seed.as_str(), name]))
    }
}
