//! Readiness multiplexer.
//!
//! Linux uses epoll with edge-triggered registrations by default. Everything
//! else gets a `poll(2)` fallback that is always level-triggered, the same
//! concession the select()-based fallbacks of classic reactors make.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::Selector;

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
mod poll;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub use self::poll::Selector;
