pub(crate) mod payload_queue;
