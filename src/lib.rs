// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative stackful fiber scheduler.
//!
//! Each hosting OS thread runs one [`runtime::scheduler::Scheduler`] instance
//! which multiplexes many fibers through explicit context switches. Fibers
//! parked on 64-bit tokens live in a process-wide [`runtime::parking`] table
//! whose retired bucket arrays are reclaimed through the [`runtime::qsbr`]
//! epoch protocol.

mod collections;

pub mod runtime;

#[macro_use]
extern crate log;

pub use crate::runtime::{
    fiber::{
        current_fiber,
        notify_all,
        notify_one,
        notify_parked,
        prepare_parking,
        suspend_conditionally,
        suspend_until_wakeup,
        FiberHandle,
        FiberId,
        FiberKind,
    },
    scheduler::{
        attach_custom_policy,
        is_shutdown,
        run,
        sleep_for,
        sleep_until,
        spawn,
        wait_until,
        yield_now,
        DispatchPolicy,
        SharedScheduler,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the calling test otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr $(,)?) => {{
        let lhs = &$lhs;
        let rhs = &$rhs;
        if lhs != rhs {
            ::anyhow::bail!(
                "ensure_eq!({}, {}) failed: {:?} != {:?}",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            );
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the calling test otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($lhs:expr, $rhs:expr $(,)?) => {{
        let lhs = &$lhs;
        let rhs = &$rhs;
        if lhs == rhs {
            ::anyhow::bail!(
                "ensure_neq!({}, {}) failed: both sides are {:?}",
                stringify!($lhs),
                stringify!($rhs),
                lhs
            );
        }
    }};
}
