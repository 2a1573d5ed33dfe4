pub const MESSAGES_RECEIVED: &str = "microservice_consumer_messages_received";
pub const HANDLER_FAILURES: &str = "microservice_consumer_handler_failures";
pub const MARK_FAILURES: &str = "microservice_consumer_mark_failures";
pub const SESSION_ERRORS: &str = "microservice_consumer_session_errors";
pub const GROUP_JOIN_FAILURES: &str = "microservice_consumer_group_join_failures";
