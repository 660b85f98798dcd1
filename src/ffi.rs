//! Raw FFI bindings to the C wrapper layer in `csrc/shan_mpi.c`.
//!
//! These are low-level unsafe functions. Use the safe wrappers in
//! [`crate::mpi`].

#![allow(non_camel_case_types)]

use std::os::raw::{c_double, c_int, c_void};

pub type int32_t = i32;
pub type int64_t = i64;
pub type uint32_t = u32;

extern "C" {
    // ============================================================
    // Initialization and Finalization
    // ============================================================

    pub fn shan_mpi_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn shan_mpi_finalize() -> c_int;
    pub fn shan_mpi_initialized(flag: *mut c_int) -> c_int;
    pub fn shan_mpi_finalized(flag: *mut c_int) -> c_int;
    pub fn shan_mpi_wtime() -> c_double;

    // ============================================================
    // Communicators
    // ============================================================

    pub fn shan_mpi_comm_world() -> int32_t;
    pub fn shan_mpi_comm_rank(comm: int32_t, rank: *mut int32_t) -> c_int;
    pub fn shan_mpi_comm_size(comm: int32_t, size: *mut int32_t) -> c_int;
    pub fn shan_mpi_comm_split_shared(comm: int32_t, newcomm: *mut int32_t) -> c_int;
    pub fn shan_mpi_comm_free(comm: int32_t) -> c_int;

    // ============================================================
    // Synchronization and Collectives
    // ============================================================

    pub fn shan_mpi_barrier(comm: int32_t) -> c_int;
    pub fn shan_mpi_bcast(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;
    pub fn shan_mpi_allgather(
        send: *const c_void,
        count: int64_t,
        recv: *mut c_void,
        datatype_tag: int32_t,
        comm: int32_t,
    ) -> c_int;
    pub fn shan_mpi_allgatherv(
        send: *const c_void,
        count: int64_t,
        recv: *mut c_void,
        counts: *const int32_t,
        displs: *const int32_t,
        datatype_tag: int32_t,
        comm: int32_t,
    ) -> c_int;
    pub fn shan_mpi_allreduce_inplace(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        op: int32_t,
        comm: int32_t,
    ) -> c_int;

    // ============================================================
    // Point-to-Point
    // ============================================================

    pub fn shan_mpi_send(
        buf: *const c_void,
        count: int64_t,
        datatype_tag: int32_t,
        dest: int32_t,
        tag: int32_t,
        comm: int32_t,
    ) -> c_int;
    pub fn shan_mpi_recv(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
    ) -> c_int;

    // ============================================================
    // Shared Windows
    // ============================================================

    pub fn shan_mpi_win_allocate_shared(
        size: int64_t,
        comm: int32_t,
        base: *mut *mut c_void,
        win: *mut int32_t,
    ) -> c_int;
    pub fn shan_mpi_win_shared_query(
        win: int32_t,
        rank: int32_t,
        size: *mut int64_t,
        base: *mut *mut c_void,
    ) -> c_int;

    // ============================================================
    // One-Sided Windows
    // ============================================================

    pub fn shan_mpi_win_create(
        base: *mut c_void,
        size: int64_t,
        comm: int32_t,
        win: *mut int32_t,
    ) -> c_int;
    pub fn shan_mpi_win_allocate_u32(
        count: int64_t,
        comm: int32_t,
        base: *mut *mut c_void,
        win: *mut int32_t,
    ) -> c_int;
    pub fn shan_mpi_win_free(win: int32_t) -> c_int;
    pub fn shan_mpi_win_sync(win: int32_t) -> c_int;
    pub fn shan_mpi_put(
        origin: *const c_void,
        size: int64_t,
        target: int32_t,
        disp: int64_t,
        win: int32_t,
    ) -> c_int;
    pub fn shan_mpi_win_flush(target: int32_t, win: int32_t) -> c_int;
    pub fn shan_mpi_win_flush_all(win: int32_t) -> c_int;
    pub fn shan_mpi_notify(value: uint32_t, target: int32_t, index: int64_t, win: int32_t) -> c_int;
    pub fn shan_mpi_notify_fetch(
        win: int32_t,
        target: int32_t,
        index: int64_t,
        value: *mut uint32_t,
    ) -> c_int;
    pub fn shan_mpi_notify_swap(
        win: int32_t,
        target: int32_t,
        index: int64_t,
        value: uint32_t,
        old: *mut uint32_t,
    ) -> c_int;
}
