fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The NodeControl bindings are normally generated here from
    // proto/nodecontrol.proto via tonic-build (which requires `protoc`).
    // This environment has no `protoc`, so pre-generated bindings are
    // committed at src/proto_gen.rs and included by `crate::proto`. When a
    // `protoc` is available, regenerate by restoring the call below.
    //
    // tonic_build::compile_protos("proto/nodecontrol.proto")?;
    println!("cargo:rerun-if-changed=proto/nodecontrol.proto");
    Ok(())
}
