/*
 * flowsession - concurrent TTL session map core
 */

pub mod cell;
pub mod rcu;
pub mod spinlock;
