//! No runtime code; this crate exists only to host the repo-wide
//! label-discipline lint under `tests/`.
