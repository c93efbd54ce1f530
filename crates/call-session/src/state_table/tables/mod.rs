mod call;

pub use call::add_call_transitions;
