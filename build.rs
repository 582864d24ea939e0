use vergen_gitcl::{Build, Emitter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let build = Build::builder().build_timestamp(true).build();
    Emitter::default()
        .fail_on_error()
        .add_instructions(&build)?
        .emit()?;
    Ok(())
}
