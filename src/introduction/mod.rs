//! Introduction protocol: content-addressed CAPTCHA puzzles
//! that let a newcomer identity bootstrap an initial trust edge without
//! a human-mediated introduction.
//!
//! [`factory`] generates a puzzle's (solution, rendered image) pair;
//! [`server`] maintains an OwnIdentity's published puzzle quota and
//! reacts to solved puzzles; [`client`] maintains the pool of puzzles
//! downloaded from other identities and submits solutions; [`lifecycle`]
//! expires and evicts puzzles and cascades deletes.

pub mod client;
pub mod factory;
pub mod lifecycle;
pub mod server;

pub use client::{Candidate, ClientPuzzlePool, PuzzleDownloadClient, SolutionInsertClient};
pub use factory::{PlaceholderRenderer, PuzzleFactory, PuzzleRenderer};
pub use server::{IntroductionServer, PuzzleInsertClient, CAPTCHA_TRUST_COMMENT};
