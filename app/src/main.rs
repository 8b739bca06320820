fn main() {
    if let Err(err) = devnet::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
