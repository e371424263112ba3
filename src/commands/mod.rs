pub mod devops;
