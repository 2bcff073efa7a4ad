fn main() {
    if let Err(error) = pomosync::run() {
        eprintln!("pomosync: {error}");
        std::process::exit(1);
    }
}
