pub mod jsonapi;
