// Domain layer - media types and the result taxonomy shared by all stages

pub mod model;
