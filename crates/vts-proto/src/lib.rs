pub mod vts {
    pub mod v1 {
        tonic::include_proto!("vts.v1");
    }
}
