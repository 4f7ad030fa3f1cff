fn main() {
    std::process::exit(daphne::cli::run());
}
