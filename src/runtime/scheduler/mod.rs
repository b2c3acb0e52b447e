// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod context;
pub mod dispatcher;
pub mod remote;
pub mod scheduler;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    dispatcher::{
        DefaultPolicy,
        DispatchPolicy,
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
        Scheduler,
        SharedScheduler,
    },
};

pub(crate) use self::scheduler::{
    current,
    defer,
    register_current_suspend_point,
    try_current,
};
