fn main() {
    if !cfg!(target_os = "linux") {
        panic!(
            "{} only works with linux kernel debug interfaces",
            env!("CARGO_PKG_NAME")
        );
    }
}
