pub mod create_request;
