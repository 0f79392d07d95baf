use fleetsim::error::AppResult;

fn main() -> AppResult<()> {
    fleetsim::entry::run()
}
