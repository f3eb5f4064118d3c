fn main() {
    if let Err(e) = built::write_built_file() {
        panic!("failed to acquire build-time information: {e}");
    }
}
