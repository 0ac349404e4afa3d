// Client side of the messaging core: identity, live bindings and the inbox session
pub mod binding;
pub mod identity;
pub mod inbox;
