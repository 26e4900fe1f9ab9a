pub mod client {
    pub mod models {
        pub mod request;
        pub mod response;
    }
    pub mod client;
    pub mod error;
}

pub mod control;
pub mod logger;
pub mod models;
pub mod queue;
