//! Request dispatch for the hyper accept loop.

pub mod dispatch;
