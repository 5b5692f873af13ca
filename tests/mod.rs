extern crate aodv_router;
extern crate chrono;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

mod common;
mod integration;
