//! Scenarios that cross crate boundaries: binder calls driving a surface,
//! and producers racing a compositor through the transaction queue.

#[cfg(test)]
mod remote_surface;

#[cfg(test)]
mod compositor_race;
